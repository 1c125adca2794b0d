//! Payment confirmation webhook.
//!
//! Parses the callback (JSON body, form-encoded fallback), checks its
//! signature and applies the `paid` transition at most once per bill.

use serde::{Deserialize, Deserializer, Serialize};

use crate::db::{BillStatus, BillStore};
use crate::error::{AppError, Result};
use crate::parser::parse_form;
use crate::token::TokenSigner;

/// Inbound webhook fields. Everything is optional at parse time; the
/// handler decides what is missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub bill_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    /// Gateways may send a number here; any JSON scalar is kept as text
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub external_ref: Option<String>,
}

fn scalar_as_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

impl WebhookPayload {
    /// Parse a JSON object, falling back to `application/x-www-form-urlencoded`
    pub fn parse(body: &[u8]) -> Self {
        if let Ok(payload) = serde_json::from_slice::<WebhookPayload>(body) {
            return payload;
        }

        let mut payload = WebhookPayload::default();
        for (key, value) in parse_form(body) {
            match key.as_str() {
                "bill_id" => payload.bill_id = Some(value),
                "status" => payload.status = Some(value),
                "signature" => payload.signature = Some(value),
                "external_ref" => payload.external_ref = Some(value),
                _ => {}
            }
        }

        payload
    }
}

/// What the webhook did. Serializes to the JSON body returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WebhookOutcome {
    /// Signed, but no such bill. Reported as success so the sender stops retrying.
    Ignored {
        ok: bool,
        ignored: bool,
        reason: &'static str,
    },
    /// Bill was already paid; nothing changed
    Idempotent { ok: bool, idempotent: bool },
    /// This call moved the bill to `paid`
    Paid {
        ok: bool,
        bill_id: String,
        new_status: BillStatus,
        external_ref: Option<String>,
    },
    /// Any status other than `paid`; acknowledged, nothing changed
    Acknowledged {
        ok: bool,
        bill_id: String,
        status: String,
    },
}

impl WebhookOutcome {
    fn ignored() -> Self {
        WebhookOutcome::Ignored {
            ok: true,
            ignored: true,
            reason: "unknown bill",
        }
    }

    fn idempotent() -> Self {
        WebhookOutcome::Idempotent {
            ok: true,
            idempotent: true,
        }
    }

    /// True when this call mutated stored state
    pub fn changed_state(&self) -> bool {
        matches!(self, WebhookOutcome::Paid { .. })
    }
}

/// Apply a payment confirmation.
///
/// Errors: `BadRequest` when `bill_id` or `status` is missing, `Forbidden`
/// when the signature does not match `bill_id`. Neither touches the store.
pub fn handle_payment(
    store: &BillStore,
    signer: &TokenSigner,
    payload: WebhookPayload,
) -> Result<WebhookOutcome> {
    let bill_id = payload.bill_id.filter(|id| !id.is_empty());
    let status = payload
        .status
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty());

    let (bill_id, status) = match (bill_id, status) {
        (Some(bill_id), Some(status)) => (bill_id, status),
        _ => return Err(AppError::BadRequest("Missing bill_id or status".into())),
    };

    let signature = payload.signature.unwrap_or_default();
    if !signer.verify(&bill_id, &signature) {
        tracing::warn!(bill_id = %bill_id, "webhook signature rejected");
        return Err(AppError::Forbidden("Invalid signature".into()));
    }

    let bill = match store.get(&bill_id)? {
        Some(bill) => bill,
        None => {
            tracing::info!(bill_id = %bill_id, "webhook for unknown bill ignored");
            return Ok(WebhookOutcome::ignored());
        }
    };

    if bill.status == BillStatus::Paid {
        return Ok(WebhookOutcome::idempotent());
    }

    if status != BillStatus::Paid.as_str() {
        tracing::info!(bill_id = %bill_id, status = %status, "unhandled webhook status, no change");
        return Ok(WebhookOutcome::Acknowledged {
            ok: true,
            bill_id,
            status,
        });
    }

    let data = serde_json::json!({
        "previous_status": bill.status,
        "external_ref": payload.external_ref,
    });

    // Another delivery may have won the race since the lookup above
    if !store.mark_paid_once(&bill_id, data, "webhook")? {
        return Ok(WebhookOutcome::idempotent());
    }

    Ok(WebhookOutcome::Paid {
        ok: true,
        bill_id,
        new_status: BillStatus::Paid,
        external_ref: payload.external_ref,
    })
}
