//! Device relay — authenticated machine sockets and the device publication.
//!
//! ## Connection lifecycle
//!
//! 1. A machine dials `GET /ws/device?id=<BRW-...>&key=<secret>`. The id and
//!    key are validated after the upgrade; rejections close with a 4xxx code
//!    (4001 bad request, 4003 key rejected). A second connect for the same
//!    id closes the first with 4002 and publishes its `device_offline`
//!    before taking over, so the old session's lifecycle fully precedes the
//!    new one's `device_online`.
//! 2. The relay greets the machine with `connected` then `request_state`
//!    (prompting an immediate state dump) and publishes `device_online`.
//! 3. Binary frames are MessagePack — possibly several messages per frame;
//!    text frames are legacy single-object JSON. Every decoded message is
//!    stamped with `deviceId` (and `timestamp` when absent) and published.
//! 4. A 10 s ping sweep counts silent sweeps per device; the third one in a
//!    row terminates the socket. Any frame resets the counter.
//! 5. On close the device is deregistered, its persisted online flag is
//!    cleared, and `device_offline` is published.
//!
//! ## Messages (cloud → device)
//!
//! | Type            | When                                           |
//! |-----------------|------------------------------------------------|
//! | `connected`     | Greeting after registration                    |
//! | `request_state` | After greeting, and on stale-cache hydration   |
//! | forwarded client/admin requests (`get_logs`, ...) with a `requestId` |

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::relay::{
    close_with, codec, pump_outbound, Outbound, CLOSE_ADMIN, CLOSE_AUTH, CLOSE_BAD_REQUEST,
    CLOSE_NORMAL, CLOSE_REPLACED, OUTBOUND_BUFFER,
};
use crate::store::CredentialStore;
use crate::util::now_ms;
use crate::AppState;

/// Broadcast capacity for the device publication. Slow subscribers observe
/// `Lagged` and drop messages rather than stalling the relay.
const PUBLICATION_BUFFER: usize = 1024;

/// Registry entry for one connected machine.
struct DeviceConnection {
    device_id: String,
    /// Distinguishes this registration from a replacement under the same id,
    /// so a replaced socket's teardown cannot evict its successor.
    epoch: Uuid,
    tx: mpsc::Sender<Outbound>,
    connected_at: Instant,
    last_seen_ms: AtomicI64,
    missed_pings: AtomicU32,
}

/// Owns the device registry and the publication all subscribers consume.
pub struct DeviceRelay {
    devices: RwLock<HashMap<String, Arc<DeviceConnection>>>,
    events: broadcast::Sender<Value>,
    store: Arc<dyn CredentialStore>,
    cfg: RelayConfig,
    started: Instant,
    published: AtomicU64,
}

/// A registered device connection as seen by the socket loop (and tests).
/// Dropping it without calling [`DeviceSession::finish`] leaks the registry
/// entry until the ping sweep collects it.
pub struct DeviceSession {
    relay: Arc<DeviceRelay>,
    conn: Arc<DeviceConnection>,
}

impl DeviceRelay {
    pub fn new(store: Arc<dyn CredentialStore>, cfg: RelayConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(PUBLICATION_BUFFER);
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            events,
            store,
            cfg,
            started: Instant::now(),
            published: AtomicU64::new(0),
        })
    }

    /// Subscribe to the device publication. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    /// Authenticate and register a device connection.
    ///
    /// Runs the full accept path: parameter validation, key verification,
    /// replacement of a prior connection (closed with 4002 first), greeting
    /// frames, persisted online flag, `device_online` publication. On
    /// rejection returns the close code and reason for the caller to send.
    pub async fn connect(
        self: &Arc<Self>,
        id: Option<String>,
        key: Option<String>,
    ) -> Result<(DeviceSession, mpsc::Receiver<Outbound>), (u16, String)> {
        let (Some(raw_id), Some(key)) = (id, key) else {
            return Err((CLOSE_BAD_REQUEST, "Missing id or key".to_string()));
        };
        if !codec::valid_device_id(&raw_id) {
            return Err((CLOSE_BAD_REQUEST, "Invalid device id".to_string()));
        }
        let device_id = codec::canonical_device_id(&raw_id);

        if key.len() < self.cfg.min_key_len
            || key.len() > self.cfg.max_key_len
            || !self.store.verify_device_key(&device_id, &key).await
        {
            return Err((CLOSE_AUTH, "Device key rejected".to_string()));
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn = Arc::new(DeviceConnection {
            device_id: device_id.clone(),
            epoch: Uuid::new_v4(),
            tx: tx.clone(),
            connected_at: Instant::now(),
            last_seen_ms: AtomicI64::new(now_ms()),
            missed_pings: AtomicU32::new(0),
        });

        {
            let mut devices = self.devices.write().await;
            if let Some(prior) = devices.get(&device_id) {
                warn!(device_id = %device_id, "Device reconnected while registered, replacing");
                let _ = prior.tx.try_send(Outbound::Close {
                    code: CLOSE_REPLACED,
                    reason: "Replaced by new connection".to_string(),
                });
                // The replaced session's teardown will find the epoch rotated
                // and skip its close path, so its device_offline must be
                // published here: the old session closes out before the new
                // one's device_online, and subscribers drop any state cached
                // from it.
                self.publish(&device_id, json!({"type": "device_offline"}));
            }
            devices.insert(device_id.clone(), Arc::clone(&conn));
        }

        if let Err(e) = self.store.update_device_status(&device_id, true).await {
            warn!(device_id = %device_id, "Failed to persist online flag: {e}");
        }

        let _ = tx
            .send(Outbound::Frame(
                json!({"type": "connected", "timestamp": now_ms()}),
            ))
            .await;
        let _ = tx
            .send(Outbound::Frame(
                json!({"type": "request_state", "timestamp": now_ms()}),
            ))
            .await;

        self.publish(&device_id, json!({"type": "device_online"}));
        info!(device_id = %device_id, "Device connected");

        Ok((
            DeviceSession {
                relay: Arc::clone(self),
                conn,
            },
            rx,
        ))
    }

    /// Send a message to a connected device as JSON text, non-blocking.
    /// Returns false when the device is not registered or its outbound
    /// channel cannot accept the frame — the caller decides whether to queue.
    pub async fn send_to_device(&self, device_id: &str, message: Value) -> bool {
        let tx = {
            let devices = self.devices.read().await;
            match devices.get(device_id) {
                Some(conn) => conn.tx.clone(),
                None => return false,
            }
        };
        tx.try_send(Outbound::Frame(message)).is_ok()
    }

    pub async fn is_device_connected(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    /// Epoch-ms timestamp of the last frame received from a device, if it is
    /// connected. The relay keeps no record of departed devices.
    pub async fn device_last_seen(&self, device_id: &str) -> Option<i64> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|conn| conn.last_seen_ms.load(Ordering::Relaxed))
    }

    pub async fn connected_device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Forcibly close a device connection (admin action, code 4000).
    /// Returns whether a device was connected.
    pub async fn disconnect_device(&self, device_id: &str) -> bool {
        let Some(conn) = self.devices.write().await.remove(device_id) else {
            return false;
        };
        let _ = conn.tx.try_send(Outbound::Close {
            code: CLOSE_ADMIN,
            reason: "Disconnected by admin".to_string(),
        });
        self.mark_offline(device_id).await;
        info!(device_id = %device_id, "Device disconnected by admin");
        true
    }

    /// Keep-alive sweep: ping every registered device, counting silent
    /// sweeps. A device that exceeds the miss budget is terminated.
    pub async fn ping_sweep(&self) {
        let snapshot: Vec<Arc<DeviceConnection>> =
            self.devices.read().await.values().cloned().collect();
        for conn in snapshot {
            let missed = conn.missed_pings.fetch_add(1, Ordering::Relaxed) + 1;
            if missed > self.cfg.max_missed_pings {
                warn!(
                    device_id = %conn.device_id,
                    missed, "Device unresponsive, terminating"
                );
                if self.deregister(&conn.device_id, conn.epoch).await {
                    let _ = conn.tx.try_send(Outbound::Close {
                        code: CLOSE_NORMAL,
                        reason: "Ping timeout".to_string(),
                    });
                    self.mark_offline(&conn.device_id).await;
                }
            } else {
                let _ = conn.tx.try_send(Outbound::Ping);
            }
        }
    }

    /// Hand the store a snapshot of connected ids so it can clear online
    /// flags orphaned by crashes or missed close events.
    pub async fn reconcile(&self) {
        let connected: HashSet<String> = self.devices.read().await.keys().cloned().collect();
        match self.store.sync_online_devices(&connected).await {
            Ok(stale) if stale > 0 => info!(stale, "Reconciled stale online flags"),
            Ok(_) => {}
            Err(e) => warn!("Device status reconciliation failed: {e}"),
        }
    }

    pub async fn stats(&self) -> Value {
        json!({
            "connectedDevices": self.connected_device_count().await,
            "messagesPublished": self.published.load(Ordering::Relaxed),
            "uptimeMs": self.started.elapsed().as_millis() as u64,
        })
    }

    /// Close every device socket and clear the registry. Persisted flags are
    /// left to the next reconciliation of whichever instance comes back.
    pub async fn shutdown(&self) {
        let mut devices = self.devices.write().await;
        for conn in devices.values() {
            let _ = conn.tx.try_send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "Relay shutting down".to_string(),
            });
        }
        devices.clear();
    }

    /// Stamp and publish a device-origin message.
    fn publish(&self, device_id: &str, mut message: Value) {
        if let Some(obj) = message.as_object_mut() {
            obj.insert("deviceId".to_string(), json!(device_id));
            obj.entry("timestamp").or_insert_with(|| json!(now_ms()));
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.events.send(message).is_err() {
            debug!(device_id = %device_id, "No subscribers for device publication");
        }
    }

    /// Remove a registration if `epoch` still owns the id. A replaced
    /// connection's teardown finds a different epoch and leaves the
    /// successor alone.
    async fn deregister(&self, device_id: &str, epoch: Uuid) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get(device_id) {
            Some(conn) if conn.epoch == epoch => {
                devices.remove(device_id);
                true
            }
            _ => false,
        }
    }

    async fn mark_offline(&self, device_id: &str) {
        if let Err(e) = self.store.update_device_status(device_id, false).await {
            warn!(device_id = %device_id, "Failed to persist offline flag: {e}");
        }
        self.publish(device_id, json!({"type": "device_offline"}));
    }
}

impl DeviceSession {
    pub fn device_id(&self) -> &str {
        &self.conn.device_id
    }

    pub fn connected_at(&self) -> Instant {
        self.conn.connected_at
    }

    /// Record liveness: any frame from the device resets its miss counter.
    pub fn touch(&self) {
        self.conn.missed_pings.store(0, Ordering::Relaxed);
        self.conn.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Decode a binary MessagePack frame and publish every contained
    /// message, in order. Undecodable frames are logged and dropped; the
    /// connection stays open.
    pub fn ingest_binary(&self, bytes: &[u8]) {
        match codec::decode_binary(bytes) {
            Ok(messages) => {
                for message in messages {
                    self.relay.publish(&self.conn.device_id, message);
                }
            }
            Err(e) => {
                warn!(device_id = %self.conn.device_id, "Dropped undecodable binary frame: {e}");
            }
        }
    }

    /// Decode a legacy JSON text frame and publish it.
    pub fn ingest_text(&self, text: &str) {
        match codec::decode_text(text) {
            Ok(message) => self.relay.publish(&self.conn.device_id, message),
            Err(e) => {
                warn!(device_id = %self.conn.device_id, "Dropped undecodable text frame: {e}");
            }
        }
    }

    /// Close path: deregister (unless replaced), clear the persisted online
    /// flag, publish `device_offline`.
    pub async fn finish(self) {
        if self
            .relay
            .deregister(&self.conn.device_id, self.conn.epoch)
            .await
        {
            self.relay.mark_offline(&self.conn.device_id).await;
            info!(device_id = %self.conn.device_id, "Device disconnected");
        }
    }
}

/// Query parameters for the device WebSocket upgrade.
#[derive(Deserialize)]
pub struct DeviceWsQuery {
    pub id: Option<String>,
    pub key: Option<String>,
}

/// `GET /ws/device?id=<BRW-...>&key=<secret>` — device WebSocket upgrade.
pub async fn device_ws(
    State(state): State<AppState>,
    Query(query): Query<DeviceWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_device_socket(socket, state, query))
}

async fn handle_device_socket(socket: WebSocket, state: AppState, query: DeviceWsQuery) {
    let (session, rx) = match state.relay.connect(query.id, query.key).await {
        Ok(registered) => registered,
        Err((code, reason)) => {
            close_with(socket, code, &reason).await;
            return;
        }
    };

    let (sink, mut stream) = socket.split();
    let send_task = tokio::spawn(pump_outbound(rx, sink));

    while let Some(Ok(msg)) = stream.next().await {
        session.touch();
        match msg {
            Message::Binary(bytes) => session.ingest_binary(&bytes),
            Message::Text(text) => session.ingest_text(&text),
            Message::Close(_) => break,
            // Pings are answered by the transport; pongs already counted as
            // liveness via touch().
            _ => {}
        }
    }

    session.finish().await;
    send_task.abort();
}
