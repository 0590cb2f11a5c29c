//! The bidirectional relay plane.
//!
//! Two connection registries with different liveness cadences:
//!
//! - [`device::DeviceRelay`] owns authenticated machine sockets (10 s ping
//!   sweep — the machines sit on lossy radios) and publishes every
//!   device-origin message on a broadcast channel.
//! - [`proxy::ClientProxy`] owns authenticated client sockets (30 s ping
//!   sweep), fans the publication out per device, buffers client→device
//!   traffic while a machine is offline ([`queue`]), and hydrates new
//!   clients from the latest snapshots ([`cache`]).
//!
//! [`request`] turns the asymmetric device channel into an awaitable RPC for
//! HTTP handlers by correlating on `requestId` over the publication.

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

pub mod cache;
pub mod codec;
pub mod device;
pub mod proxy;
pub mod queue;
pub mod request;

/// Forced disconnect by an admin.
pub const CLOSE_ADMIN: u16 = 4000;
/// Missing or malformed connect parameters.
pub const CLOSE_BAD_REQUEST: u16 = 4001;
/// A newer connection took over this device id.
pub const CLOSE_REPLACED: u16 = 4002;
/// Session token failed verification (client plane reuse of 4002).
pub const CLOSE_BAD_TOKEN: u16 = 4002;
/// Key rejected or device not owned by the token's user.
pub const CLOSE_AUTH: u16 = 4003;
/// Normal server-side closure (ping timeout, shutdown).
pub const CLOSE_NORMAL: u16 = 1000;

/// Messages queued for delivery to one socket. Each connection owns an mpsc
/// channel of these so registry code can write without holding the socket.
pub enum Outbound {
    /// A JSON frame, serialized at send time.
    Frame(Value),
    /// A pre-serialized frame (fan-out serializes once per publication).
    Raw(String),
    /// WebSocket ping.
    Ping,
    /// Close the socket with a code and reason, then stop pumping.
    Close { code: u16, reason: String },
}

/// Channel capacity per connection. Sends are non-blocking; a peer that
/// cannot drain this many frames is dropped rather than back-pressured.
pub(crate) const OUTBOUND_BUFFER: usize = 256;

/// Forward queued [`Outbound`] messages to a WebSocket sink. Ends when the
/// channel closes, the sink errors, or a `Close` is pumped.
pub(crate) async fn pump_outbound(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    while let Some(out) = rx.recv().await {
        let msg = match out {
            Outbound::Frame(value) => match serde_json::to_string(&value) {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    error!("Failed to serialize outbound frame: {e}");
                    continue;
                }
            },
            Outbound::Raw(text) => Message::Text(text.into()),
            Outbound::Ping => Message::Ping(Bytes::new()),
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        };
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

/// Close an unsplit socket with a 4xxx rejection. Used before a connection
/// is registered (auth failures happen after the upgrade completes, since
/// close codes require a finished handshake).
pub(crate) async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
