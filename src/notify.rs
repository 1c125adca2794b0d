//! Reminder delivery.
//!
//! SMS goes through the Vonage (Nexmo) REST endpoint when credentials and a
//! destination are present; everything else lands in the console sink. A
//! delivery attempt always produces a `NotificationResult`, failures included.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::db::Bill;

/// Requested delivery channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// SMS when possible, console otherwise
    #[default]
    Auto,
    Sms,
    /// Not wired to a provider; delivered to the console sink
    Email,
    Console,
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResult {
    /// Channel actually used: "sms" or "console"
    pub channel: String,
    /// HTTP status code of the provider call, "ok" or "error"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotificationResult {
    fn console() -> Self {
        Self {
            channel: "console".to_string(),
            status: "ok".to_string(),
            response: None,
            error: None,
        }
    }

    fn sms_error(error: String) -> Self {
        Self {
            channel: "sms".to_string(),
            status: "error".to_string(),
            response: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone)]
struct SmsCredentials {
    api_key: String,
    api_secret: String,
    from: String,
}

/// Sends reminders; one instance per process, cheap to clone
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<SmsCredentials>,
}

impl Notifier {
    pub fn from_config(config: &Config) -> Self {
        let credentials = config.sms_credentials().map(|(key, secret)| SmsCredentials {
            api_key: key.to_string(),
            api_secret: secret.to_string(),
            from: config.vonage_from.clone(),
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            client,
            endpoint: config.vonage_endpoint.clone(),
            credentials,
        }
    }

    /// Console-only notifier
    pub fn console() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: String::new(),
            credentials: None,
        }
    }

    /// Deliver `message`. Never fails; errors are reported in the result.
    pub async fn send(&self, message: &str, channel: Channel, to: Option<&str>) -> NotificationResult {
        let to = to.map(str::trim).filter(|t| !t.is_empty());

        if let (Channel::Auto | Channel::Sms, Some(creds), Some(to)) =
            (channel, self.credentials.as_ref(), to)
        {
            return self.send_sms(creds, message, to).await;
        }

        tracing::info!(target: "notify", to = to.unwrap_or("demo"), "{}", message);
        NotificationResult::console()
    }

    async fn send_sms(&self, creds: &SmsCredentials, message: &str, to: &str) -> NotificationResult {
        let form = [
            ("api_key", creds.api_key.as_str()),
            ("api_secret", creds.api_secret.as_str()),
            ("to", to),
            ("from", creds.from.as_str()),
            ("text", message),
        ];

        let resp = match self.client.post(&self.endpoint).form(&form).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "SMS delivery failed");
                return NotificationResult::sms_error(e.to_string());
            }
        };

        let status = resp.status().as_u16().to_string();
        match resp.text().await {
            Ok(body) => NotificationResult {
                channel: "sms".to_string(),
                status,
                response: Some(body),
                error: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "SMS response unreadable");
                NotificationResult::sms_error(e.to_string())
            }
        }
    }
}

/// Reminder text for a bill and its pay link
pub fn reminder_message(bill: &Bill, link: &str) -> String {
    format!(
        "Reminder: Unpaid bill from {} amount ${:.2} due {}. Pay/review: {}",
        bill.vendor,
        bill.amount,
        bill.due_date.format("%Y-%m-%d"),
        link
    )
}
