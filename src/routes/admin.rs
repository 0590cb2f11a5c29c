//! Admin observability and control endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::relay::codec;
use crate::AppState;

/// `GET /api/stats` — relay and proxy counters for the dashboard.
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "relay": state.relay.stats().await,
        "proxy": state.proxy.stats().await,
    }))
}

/// `GET /api/devices` — connected devices with liveness and client counts.
pub async fn list_devices(State(state): State<AppState>) -> Json<Value> {
    let proxy_stats = state.proxy.stats().await;
    let mut devices: Vec<Value> = Vec::new();
    for device_id in state.relay.connected_devices().await {
        let last_seen = state.relay.device_last_seen(&device_id).await;
        let clients = proxy_stats["clientsByDevice"][&device_id]
            .as_u64()
            .unwrap_or(0);
        devices.push(json!({
            "deviceId": device_id,
            "lastSeen": last_seen,
            "clients": clients,
        }));
    }
    Json(json!({"devices": devices}))
}

/// `POST /api/devices/{id}/disconnect` — force-close a device socket
/// (close code 4000). Returns whether a device was connected.
pub async fn disconnect_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let device_id = codec::canonical_device_id(&id);
    if state.relay.disconnect_device(&device_id).await {
        Ok(Json(json!({"disconnected": true, "deviceId": device_id})))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Device '{device_id}' not connected")})),
        ))
    }
}
