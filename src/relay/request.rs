//! Awaitable RPC from HTTP handlers to devices.
//!
//! The device channel is asymmetric: the cloud writes a request frame and
//! the machine eventually publishes a reply tagged with the same
//! `requestId`. This helper subscribes to the publication *before* sending,
//! filters for `(deviceId, requestId, type)`, and times out after 10 s.
//! Dropping the receiver on every exit path is the unsubscribe.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::relay::device::DeviceRelay;
use crate::util::{new_request_id, now_ms};

/// Send `msg_type` (with optional extra fields from `payload`) to a device
/// and await the correlated reply.
///
/// Resolution:
/// - a publication of type `<msg_type>_response` carrying our `requestId`
///   resolves with that message;
/// - a publication of type `error` carrying our `requestId` rejects with its
///   `message`;
/// - `Err("Device not connected")` when the send fails immediately;
/// - `Err("Request timeout")` after `timeout`.
pub async fn request_device(
    relay: &DeviceRelay,
    device_id: &str,
    msg_type: &str,
    payload: Option<Value>,
    timeout: Duration,
) -> Result<Value, String> {
    let request_id = new_request_id();
    let mut message = match payload {
        Some(value @ Value::Object(_)) => value,
        Some(_) => return Err("Request payload must be an object".to_string()),
        None => json!({}),
    };
    if let Some(obj) = message.as_object_mut() {
        obj.insert("type".to_string(), json!(msg_type));
        obj.insert("requestId".to_string(), json!(request_id.clone()));
        obj.insert("timestamp".to_string(), json!(now_ms()));
    }

    // Subscribe first so a fast reply cannot slip past us.
    let mut rx = relay.subscribe();

    if !relay.send_to_device(device_id, message).await {
        return Err("Device not connected".to_string());
    }

    let expected = format!("{msg_type}_response");
    let wait = tokio::time::timeout(timeout, async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event["deviceId"].as_str() != Some(device_id)
                        || event["requestId"].as_str() != Some(request_id.as_str())
                    {
                        continue;
                    }
                    match event["type"].as_str() {
                        Some(t) if t == expected => return Ok(event),
                        Some("error") => {
                            let reason = event["message"]
                                .as_str()
                                .unwrap_or("Device reported an error")
                                .to_string();
                            return Err(reason);
                        }
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err("Relay shut down".to_string());
                }
            }
        }
    })
    .await;

    match wait {
        Ok(result) => result,
        Err(_) => Err("Request timeout".to_string()),
    }
}
