//! Axum surface: opportunity-changed webhook and liveness check.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use oppcomm_sync::{ReconcileService, SingleOutcome, SingleRequest};
use serde_json::{json, Map, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "oppcomm-web";

/// Keys under `customData` that may carry the loan amount, in priority order.
pub const LOAN_AMOUNT_KEYS: [&str; 4] = ["loan-amount", "loan_amount", "Loan Amount", "loan amount"];

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReconcileService>,
}

impl AppState {
    pub fn new(service: Arc<ReconcileService>) -> Self {
        Self { service }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/webhook", post(webhook_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding webhook listener on port {port}"))?;
    info!(port, "listening for webhook events");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving webhook endpoint")?;
    Ok(())
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({"status": "active", "service": "Commission Updater"}))
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

/// Python-style truthiness: null, blank text, zero and `false` count as absent.
fn is_present(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::String(s) => !s.trim().is_empty(),
        JsonValue::Number(n) => n.as_f64() != Some(0.0),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

fn text_field(payload: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match payload.get(*key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn override_amount(payload: &Map<String, JsonValue>) -> Option<JsonValue> {
    let custom = ["customData", "custom_data"]
        .iter()
        .find_map(|key| payload.get(*key)?.as_object())?;
    LOAN_AMOUNT_KEYS
        .iter()
        .filter_map(|key| custom.get(*key))
        .find(|value| is_present(value))
        .cloned()
}

/// Turn a webhook body into a single-record request.
///
/// `Err` carries the client-facing message for malformed input.
pub fn parse_event(payload: &JsonValue) -> Result<SingleRequest, &'static str> {
    let Some(payload) = payload.as_object().filter(|o| !o.is_empty()) else {
        return Err("No JSON payload provided");
    };
    let Some(opportunity_id) = text_field(payload, &["id"]) else {
        return Err("Missing 'id' in payload");
    };
    Ok(SingleRequest {
        opportunity_id,
        pipeline_id: text_field(payload, &["pipelineId", "pipeline_id"]),
        override_amount: override_amount(payload),
    })
}

/// Business outcomes always answer 200 so the sender does not retry; only
/// malformed input gets a 400.
async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<JsonValue>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            warn!(error = %rejection, "rejected webhook body");
            return bad_request("No JSON payload provided");
        }
    };
    info!(%payload, "received webhook payload");

    let request = match parse_event(&payload) {
        Ok(request) => request,
        Err(message) => return bad_request(message),
    };

    let service = state.service.clone();
    let opportunity_id = request.opportunity_id.clone();
    let outcome = match tokio::spawn(async move { service.process_single(request).await }).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(%opportunity_id, error = %err, "single opportunity task aborted");
            SingleOutcome {
                success: false,
                message: format!("Error: {err}"),
            }
        }
    };

    if outcome.success {
        Json(json!({"status": "success", "message": outcome.message})).into_response()
    } else {
        warn!(%opportunity_id, reason = %outcome.message, "processing failed");
        Json(json!({"status": "ignored", "reason": outcome.message})).into_response()
    }
}
