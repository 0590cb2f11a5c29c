//! Log-capture endpoints, proxied to the device over the relay.
//!
//! Each handler drives the request/response correlation protocol: build a
//! `requestId`-tagged message, send it through the relay, and await the
//! device's `<type>_response` (or `error`) publication for up to 10 s.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::relay::codec;
use crate::relay::request::request_device;
use crate::AppState;

type HandlerResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

/// Map a correlation failure to an HTTP status: 404 when the device isn't
/// connected, 504 on timeout, 502 when the device replied with `error`.
fn request_error_to_http(err: String) -> (StatusCode, Json<Value>) {
    let status = match err.as_str() {
        "Device not connected" => StatusCode::NOT_FOUND,
        "Request timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({"error": err})))
}

async fn proxy_request(
    state: &AppState,
    device_id: &str,
    msg_type: &str,
    payload: Option<Value>,
) -> HandlerResult {
    let device_id = codec::canonical_device_id(device_id);
    let timeout = Duration::from_secs(state.config.proxy.request_timeout_secs);
    request_device(&state.relay, &device_id, msg_type, payload, timeout)
        .await
        .map(Json)
        .map_err(request_error_to_http)
}

/// `GET /api/devices/{id}/logs/info` — log buffer status on the device.
pub async fn get_log_info(State(state): State<AppState>, Path(id): Path<String>) -> HandlerResult {
    proxy_request(&state, &id, "get_log_info", None).await
}

/// Query parameters for `GET /api/devices/{id}/logs`.
#[derive(Deserialize)]
pub struct GetLogsQuery {
    /// Maximum entries to fetch; device default applies when omitted.
    pub count: Option<u64>,
}

/// `GET /api/devices/{id}/logs` — fetch captured log entries.
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<GetLogsQuery>,
) -> HandlerResult {
    let payload = query.count.map(|count| json!({"count": count}));
    proxy_request(&state, &id, "get_logs", payload).await
}

/// `DELETE /api/devices/{id}/logs` — clear the device's log buffer.
pub async fn clear_logs(State(state): State<AppState>, Path(id): Path<String>) -> HandlerResult {
    proxy_request(&state, &id, "clear_logs", None).await
}

/// Body for the boolean toggle endpoints.
#[derive(Deserialize)]
pub struct TogglePayload {
    pub enabled: bool,
}

/// `POST /api/devices/{id}/logs/enabled` — enable or disable log capture.
pub async fn set_log_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TogglePayload>,
) -> HandlerResult {
    proxy_request(&state, &id, "set_log_enabled", Some(json!({"enabled": body.enabled}))).await
}

/// `POST /api/devices/{id}/logs/pico-forwarding` — toggle forwarding of the
/// brew controller's logs into the capture buffer.
pub async fn set_pico_log_forwarding(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TogglePayload>,
) -> HandlerResult {
    proxy_request(
        &state,
        &id,
        "set_pico_log_forwarding",
        Some(json!({"enabled": body.enabled})),
    )
    .await
}

/// `POST /api/devices/{id}/logs/debug` — toggle verbose debug logging.
pub async fn set_debug_logs_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TogglePayload>,
) -> HandlerResult {
    proxy_request(
        &state,
        &id,
        "set_debug_logs_enabled",
        Some(json!({"enabled": body.enabled})),
    )
    .await
}
