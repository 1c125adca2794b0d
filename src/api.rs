// HTTP API - axum router, API-key guard, pay page and payment webhook

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{header::CONTENT_TYPE, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::{Bill, BillEvent, BillStatus, BillStore, NewBill};
use crate::error::{AppError, Result};
use crate::notify::{reminder_message, Channel, Notifier};
use crate::parser::{parse_bill_text, parse_form};
use crate::token::TokenSigner;
use crate::webhook::{handle_payment, WebhookPayload};

pub const SERVICE_NAME: &str = "CivicAPI";

/// Upper bound for uploaded bill bodies
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: BillStore,
    pub signer: TokenSigner,
    pub notifier: Notifier,
}

impl AppState {
    /// Open the store and derive signer and notifier from `config`
    pub fn new(config: Config) -> Result<Self> {
        let store = BillStore::open(config.database_path())?;
        let signer = TokenSigner::new(&config.webhook_secret);
        let notifier = Notifier::from_config(&config);

        Ok(Self {
            config: Arc::new(config),
            store,
            signer,
            notifier,
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let detail = if self.is_client_error() {
            self.to_string()
        } else {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
            "Internal server error".to_string()
        };

        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/upload", post(upload_bill))
        .route("/bills", get(list_bills))
        .route("/bills/:bill_id", get(get_bill))
        .route("/bills/:bill_id/events", get(bill_events))
        .route("/bills/:bill_id/mark_paid", post(mark_paid))
        .route("/notify", post(notify))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let mut app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/pay/:bill_id", get(pay_page))
        .route("/webhooks/payment", post(payment_webhook))
        .merge(protected);

    let ui_dir = std::path::Path::new(&state.config.ui_dir);
    if ui_dir.is_dir() {
        app = app.nest_service("/ui", ServeDir::new(ui_dir));
    }

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&state.config)),
    )
    .with_state(state)
}

/// Explicit origins get credentials; otherwise any origin without credentials
fn cors_layer(config: &Config) -> CorsLayer {
    let methods = [Method::GET, Method::POST];
    let origins: Vec<HeaderValue> = config
        .cors_origins()
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    }
}

/// Rejects requests whose `x-api-key` does not match the configured key.
/// With no key configured every request is rejected.
async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> std::result::Result<Response, AppError> {
    let presented = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = state.config.api_key.as_str();
    if expected.is_empty() || presented != expected {
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(req).await)
}

// ============================================================================
// Public handlers
// ============================================================================

/// GET / and /health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut payload = serde_json::json!({
        "ok": true,
        "service": SERVICE_NAME,
        "version": crate::VERSION,
        "time": Utc::now().to_rfc3339(),
    });

    if state.config.debug {
        payload["db_path"] = serde_json::json!(state.store.path().display().to_string());
    }

    Json(payload)
}

#[derive(Debug, Deserialize)]
struct PayQuery {
    #[serde(default)]
    t: Option<String>,
}

/// GET /pay/:bill_id?t=token - demo payment page
async fn pay_page(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
    Query(query): Query<PayQuery>,
) -> Result<Html<String>> {
    let token = query.t.unwrap_or_default();
    if !state.signer.verify(&bill_id, &token) {
        return Err(AppError::Forbidden("Invalid token".into()));
    }

    let bill = state
        .store
        .get(&bill_id)?
        .ok_or_else(|| AppError::NotFound("Bill not found".into()))?;

    let external_ref = format!("demo-{}", Utc::now().timestamp_millis());
    Ok(Html(render_pay_page(&bill, &state.signer.sign(&bill.id), &external_ref)))
}

fn render_pay_page(bill: &Bill, signature: &str, external_ref: &str) -> String {
    let esc = ammonia::clean_text;

    format!(
        r#"<html><body style="font-family:system-ui">
  <h2>Pay Bill</h2>
  <p><b>Vendor:</b> {vendor}<br/>
     <b>Amount:</b> ${amount:.2}<br/>
     <b>Due:</b> {due}<br/>
     <b>Status:</b> {status}</p>
  <p>This is a demo page. In production, redirect to a real gateway and configure its webhook to call <code>/webhooks/payment</code>.</p>
  <form method="post" action="/webhooks/payment">
    <input type="hidden" name="bill_id" value="{id}" />
    <input type="hidden" name="status" value="paid" />
    <input type="hidden" name="external_ref" value="{external_ref}" />
    <input type="hidden" name="signature" value="{signature}" />
    <button type="submit">Simulate Payment (Demo)</button>
  </form>
</body></html>
"#,
        vendor = esc(&bill.vendor),
        amount = bill.amount,
        due = bill.due_date.format("%Y-%m-%d"),
        status = bill.status,
        id = esc(&bill.id),
        external_ref = esc(external_ref),
        signature = esc(signature),
    )
}

/// POST /webhooks/payment - JSON or form-encoded confirmation
async fn payment_webhook(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse> {
    let payload = WebhookPayload::parse(&body);
    let outcome = handle_payment(&state.store, &state.signer, payload)?;
    Ok(Json(outcome))
}

// ============================================================================
// Protected handlers
// ============================================================================

/// Fields of an upload, from multipart or urlencoded form
#[derive(Debug, Default)]
struct UploadFields {
    file: Option<String>,
    vendor: Option<String>,
    amount: Option<String>,
    due_date: Option<String>,
    note: Option<String>,
    payload: Option<String>,
}

impl UploadFields {
    fn set(&mut self, name: &str, value: String) {
        let slot = match name {
            "vendor" => &mut self.vendor,
            "amount" => &mut self.amount,
            "due_date" => &mut self.due_date,
            "note" => &mut self.note,
            "payload" => &mut self.payload,
            _ => return,
        };
        *slot = Some(value).filter(|v| !v.is_empty());
    }

    /// JSON payload wins over an attached file, which wins over plain fields
    fn into_new_bill(self, today: NaiveDate) -> Result<NewBill> {
        if let Some(payload) = self.payload {
            return serde_json::from_str::<NewBill>(&payload)
                .map_err(|e| AppError::BadRequest(format!("Invalid payload JSON: {}", e)));
        }

        if let Some(text) = self.file {
            return Ok(parse_bill_text(&text, today));
        }

        match (self.vendor, self.amount, self.due_date) {
            (Some(vendor), Some(amount), Some(due_date)) => {
                NewBill::from_fields(&vendor, &amount, &due_date, self.note.as_deref())
            }
            _ => Err(AppError::BadRequest(
                "Provide either a file, form fields (vendor, amount, due_date), or JSON payload"
                    .into(),
            )),
        }
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<UploadFields> {
    let mut fields = UploadFields::default();
    let bad = |e: axum::extract::multipart::MultipartError| AppError::BadRequest(e.body_text());

    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let bytes = field.bytes().await.map_err(bad)?;
            fields.file = Some(String::from_utf8_lossy(&bytes).into_owned());
        } else {
            let value = field.text().await.map_err(bad)?;
            fields.set(&name, value);
        }
    }

    Ok(fields)
}

/// POST /upload - create a bill from a file, form fields or JSON
async fn upload_bill(State(state): State<AppState>, req: Request) -> Result<Json<Bill>> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let new_bill = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(req, &state)
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        read_multipart(multipart).await?.into_new_bill(Utc::now().date_naive())?
    } else {
        let body = axum::body::to_bytes(req.into_body(), MAX_UPLOAD_BYTES)
            .await
            .map_err(|e| AppError::BadRequest(format!("Unreadable body: {}", e)))?;

        if content_type.starts_with("application/json") {
            serde_json::from_slice::<NewBill>(&body)
                .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?
        } else {
            let mut fields = UploadFields::default();
            for (name, value) in parse_form(&body) {
                fields.set(&name, value);
            }
            fields.into_new_bill(Utc::now().date_naive())?
        }
    };

    let bill = state.store.create(new_bill, "api")?;
    Ok(Json(bill))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
}

/// GET /bills?status=unpaid|paid|canceled
async fn list_bills(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(s.parse::<BillStatus>()?),
    };

    let items = state.store.list(status)?;
    Ok(Json(serde_json::json!({ "items": items })))
}

/// GET /bills/:bill_id
async fn get_bill(State(state): State<AppState>, Path(bill_id): Path<String>) -> Result<Json<Bill>> {
    state
        .store
        .get(&bill_id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Bill not found".into()))
}

/// GET /bills/:bill_id/events
async fn bill_events(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
) -> Result<impl IntoResponse> {
    if state.store.get(&bill_id)?.is_none() {
        return Err(AppError::NotFound("Bill not found".into()));
    }

    let items = state.store.events_for(&bill_id)?;
    Ok(Json(serde_json::json!({ "items": items })))
}

/// POST /bills/:bill_id/mark_paid
async fn mark_paid(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
) -> Result<impl IntoResponse> {
    if !state.store.set_status(&bill_id, BillStatus::Paid, "api")? {
        return Err(AppError::NotFound("Bill not found".into()));
    }

    Ok(Json(serde_json::json!({
        "ok": true,
        "bill_id": bill_id,
        "status": BillStatus::Paid,
    })))
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    bill_id: String,
    #[serde(default)]
    channel: Channel,
    #[serde(default)]
    to: Option<String>,
}

/// POST /notify - send a reminder with a signed pay link
async fn notify(
    State(state): State<AppState>,
    Json(req): Json<NotifyRequest>,
) -> Result<impl IntoResponse> {
    let bill = state
        .store
        .get(&req.bill_id)?
        .ok_or_else(|| AppError::NotFound("Bill not found".into()))?;

    let link = state.signer.pay_link(&state.config.public_base_url, &bill.id);
    let message = reminder_message(&bill, &link);
    let result = state.notifier.send(&message, req.channel, req.to.as_deref()).await;

    let event = BillEvent::new(
        "reminder_sent",
        &bill.id,
        serde_json::json!({
            "channel": result.channel,
            "status": result.status,
            "error": result.error,
        }),
        "api",
    );
    if let Err(e) = state.store.record_event(&event) {
        tracing::warn!(bill_id = %bill.id, error = %e, "could not record reminder event");
    }

    Ok(Json(serde_json::json!({
        "ok": true,
        "sent_via": result,
        "link": link,
    })))
}
