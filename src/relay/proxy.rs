//! Client proxy — authenticated end-user sockets, fan-out, offline queue,
//! state cache, and in-band token lifecycle.
//!
//! ## Connection lifecycle
//!
//! 1. A client dials `GET /ws?token=<access token>&device=<BRW-...>`.
//!    Validation happens after the upgrade; rejections close with 4001
//!    (missing params), 4002 (bad token), or 4003 (device not owned).
//! 2. The proxy replies with a `connected` frame carrying the session id and
//!    device liveness, then hydrates the client from the state cache. A
//!    cache older than the staleness window (or empty) triggers a
//!    `request_state` to the device.
//! 3. Device publications are fanned out to every client bound to that
//!    device, serialized once per frame.
//! 4. Client frames are JSON. `refresh_auth`, `ping`, and `get_metrics` are
//!    handled in place; everything else is stamped and forwarded to the
//!    device, or buffered in the pending queue when it is offline.
//! 5. A 30 s ping sweep terminates clients after the third silent sweep.
//!
//! ## Message types (client → cloud)
//!
//! | Type           | Fields      | Response                                |
//! |----------------|-------------|-----------------------------------------|
//! | `refresh_auth` | `token`     | `auth_refreshed` (never closes on fail)  |
//! | `ping`         | `timestamp?`| `pong` with `clientTimestamp` echoed     |
//! | `get_metrics`  | —           | `metrics`                                |
//! | anything else  | —           | forwarded, or `device_status` when queued|
//!
//! ## Message types (cloud → client)
//!
//! | Type                  | When                                          |
//! |-----------------------|-----------------------------------------------|
//! | `connected`           | Greeting with session + device liveness       |
//! | `device_status`       | Send attempted while the device is offline    |
//! | `device_online` / `device_offline` | Relayed device lifecycle         |
//! | `token_expiring`      | 5 min before access-token expiry              |
//! | `auth_refreshed`      | Reply to `refresh_auth`                       |
//! | `queued_message_sent` | A buffered message reached the device         |
//! | relayed telemetry     | `status`, `status_delta`, `esp_status`, ...   |

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::relay::cache::StateCache;
use crate::relay::device::DeviceRelay;
use crate::relay::queue::PendingQueues;
use crate::relay::{
    close_with, codec, pump_outbound, Outbound, CLOSE_AUTH, CLOSE_BAD_REQUEST, CLOSE_BAD_TOKEN,
    CLOSE_NORMAL, OUTBOUND_BUFFER,
};
use crate::store::CredentialStore;
use crate::util::now_ms;
use crate::AppState;

/// Per-connection traffic counters, reported by `get_metrics`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    /// Client→device messages successfully forwarded.
    pub messages_sent: u64,
    /// Device→client frames delivered to this socket.
    pub messages_received: u64,
    /// Most recent keep-alive round trip, milliseconds.
    pub last_ping_rtt: Option<u64>,
    /// Running mean of keep-alive round trips.
    pub avg_ping_rtt: f64,
    pub ping_count: u64,
    pub reconnect_count: u64,
}

/// Registry entry for one client session.
struct ClientConnection {
    session_id: String,
    user_id: String,
    device_id: String,
    tx: mpsc::Sender<Outbound>,
    connected_at: Instant,
    last_activity_ms: AtomicI64,
    missed_pongs: AtomicU32,
    token_expires_ms: AtomicI64,
    /// One-shot `token_expiring` timer. Replaced on auth refresh, aborted on
    /// disconnect.
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
    metrics: Mutex<ConnectionMetrics>,
    /// Instant of the last keep-alive ping, for RTT on the next pong.
    ping_started: Mutex<Option<Instant>>,
}

/// Owns client sessions, the per-device index, the pending queues, and the
/// state cache. Subscribes to the device publication for fan-out.
pub struct ClientProxy {
    relay: Arc<DeviceRelay>,
    store: Arc<dyn CredentialStore>,
    cfg: ProxyConfig,
    /// Primary session table, keyed by session id.
    sessions: RwLock<HashMap<String, Arc<ClientConnection>>>,
    /// Device id → session ids bound to it.
    by_device: RwLock<HashMap<String, HashSet<String>>>,
    queues: PendingQueues,
    cache: StateCache,
    fanout: Mutex<Option<JoinHandle<()>>>,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    started: Instant,
}

/// A registered client session as seen by the socket loop (and tests).
pub struct ClientSession {
    proxy: Arc<ClientProxy>,
    conn: Arc<ClientConnection>,
}

impl ClientProxy {
    pub fn new(
        relay: Arc<DeviceRelay>,
        store: Arc<dyn CredentialStore>,
        cfg: ProxyConfig,
    ) -> Arc<Self> {
        let queues = PendingQueues::new(cfg.queue_capacity, Duration::from_secs(cfg.queue_ttl_secs));
        Arc::new(Self {
            relay,
            store,
            cfg,
            sessions: RwLock::new(HashMap::new()),
            by_device: RwLock::new(HashMap::new()),
            queues,
            cache: StateCache::new(),
            fanout: Mutex::new(None),
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            started: Instant::now(),
        })
    }

    /// Start the fan-out task consuming the device publication. Must run
    /// before clients connect; idempotent setup is the caller's problem.
    pub async fn start(self: &Arc<Self>) {
        let proxy = Arc::clone(self);
        let mut rx = proxy.relay.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => proxy.handle_publication(event).await,
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(dropped, "Fan-out lagged behind the device publication");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.fanout.lock().await = Some(task);
    }

    /// Authenticate and register a client session.
    ///
    /// Runs the full accept path: parameter validation, token verification,
    /// ownership check, registration in both tables, `connected` greeting,
    /// cache hydration, expiry-warning timer. On rejection returns the close
    /// code and reason for the caller to send.
    pub async fn connect(
        self: &Arc<Self>,
        token: Option<String>,
        device: Option<String>,
    ) -> Result<(ClientSession, mpsc::Receiver<Outbound>), (u16, String)> {
        let (Some(token), Some(device)) = (token, device) else {
            return Err((CLOSE_BAD_REQUEST, "Missing token or device".to_string()));
        };
        let Some(auth) = self.store.verify_access_token(&token).await else {
            return Err((CLOSE_BAD_TOKEN, "Invalid session token".to_string()));
        };
        let device_id = codec::canonical_device_id(&device);
        if !self.store.user_owns_device(&auth.user.id, &device_id).await {
            return Err((CLOSE_AUTH, "Device not owned by user".to_string()));
        }

        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let expires_ms = auth.access_expires_at.timestamp_millis();
        let conn = Arc::new(ClientConnection {
            session_id: session_id.clone(),
            user_id: auth.user.id.clone(),
            device_id: device_id.clone(),
            tx: tx.clone(),
            connected_at: Instant::now(),
            last_activity_ms: AtomicI64::new(now_ms()),
            missed_pongs: AtomicU32::new(0),
            token_expires_ms: AtomicI64::new(expires_ms),
            expiry_timer: Mutex::new(None),
            metrics: Mutex::new(ConnectionMetrics::default()),
            ping_started: Mutex::new(None),
        });

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::clone(&conn));
        self.by_device
            .write()
            .await
            .entry(device_id.clone())
            .or_default()
            .insert(session_id.clone());
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        let device_online = self.relay.is_device_connected(&device_id).await;
        let device_last_seen = self.relay.device_last_seen(&device_id).await;
        let _ = tx
            .send(Outbound::Frame(json!({
                "type": "connected",
                "sessionId": &session_id,
                "deviceId": &device_id,
                "deviceOnline": device_online,
                "deviceLastSeen": device_last_seen,
                "tokenExpiresAt": expires_ms,
                "serverTime": now_ms(),
                "timestamp": now_ms(),
            })))
            .await;

        if device_online {
            self.hydrate(&device_id, &tx).await;
        }
        // Offline: nothing further; the client hears device_online later.

        self.schedule_expiry_warning(&conn).await;

        info!(
            session_id = %session_id,
            device_id = %device_id,
            user_id = %auth.user.id,
            "Client connected"
        );

        Ok((
            ClientSession {
                proxy: Arc::clone(self),
                conn,
            },
            rx,
        ))
    }

    /// Send cached snapshots to a newly connected client, and decide whether
    /// the device owes us a fresh state dump.
    async fn hydrate(&self, device_id: &str, tx: &mpsc::Sender<Outbound>) {
        if self.cache.has_data(device_id).await {
            for frame in self.cache.hydration_frames(device_id).await {
                let _ = tx.send(Outbound::Frame(frame)).await;
            }
            let stale = self
                .cache
                .age(device_id)
                .await
                .map_or(true, |age| age > Duration::from_secs(self.cfg.cache_stale_secs));
            if stale {
                self.request_device_state(device_id).await;
            }
            // Fresh cache: the device's periodic status stream covers it.
        } else {
            self.request_device_state(device_id).await;
        }
    }

    async fn request_device_state(&self, device_id: &str) {
        self.relay
            .send_to_device(
                device_id,
                json!({"type": "request_state", "timestamp": now_ms()}),
            )
            .await;
    }

    /// One device publication: fold into the cache, react to lifecycle
    /// types, then fan out to every bound client.
    async fn handle_publication(&self, event: Value) {
        let Some(device_id) = event["deviceId"].as_str().map(ToString::to_string) else {
            return;
        };
        match event["type"].as_str().unwrap_or("") {
            "device_online" => self.flush_queue(&device_id).await,
            "device_offline" => self.cache.clear(&device_id).await,
            _ => {
                self.cache.apply(&device_id, &event).await;
            }
        }
        self.fan_out(&device_id, &event).await;
    }

    /// Write one publication to every client bound to the device. The frame
    /// is serialized once; clients that cannot accept it are skipped.
    async fn fan_out(&self, device_id: &str, event: &Value) {
        let session_ids: Vec<String> = {
            let by_device = self.by_device.read().await;
            match by_device.get(device_id) {
                Some(ids) => ids.iter().cloned().collect(),
                None => {
                    debug!(device_id = %device_id, "No clients bound to device, dropping publication");
                    return;
                }
            }
        };

        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                warn!(device_id = %device_id, "Failed to serialize publication: {e}");
                return;
            }
        };

        let sessions = self.sessions.read().await;
        for session_id in session_ids {
            if let Some(conn) = sessions.get(&session_id) {
                if conn.tx.try_send(Outbound::Raw(text.clone())).is_ok() {
                    conn.metrics.lock().await.messages_received += 1;
                    self.total_messages.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drain a device's pending queue in one pass now that it is online.
    ///
    /// Expired entries were already discarded by the take. Send failures
    /// bump the entry's retry counter but the pass is single-shot — the
    /// queue is emptied regardless of individual outcomes.
    async fn flush_queue(&self, device_id: &str) {
        let entries = self.queues.take(device_id).await;
        if entries.is_empty() {
            return;
        }
        info!(device_id = %device_id, count = entries.len(), "Flushing pending messages");
        for mut entry in entries {
            if self
                .relay
                .send_to_device(device_id, entry.message.clone())
                .await
            {
                self.total_messages.fetch_add(1, Ordering::Relaxed);
                let sessions = self.sessions.read().await;
                if let Some(conn) = sessions.get(&entry.origin_session) {
                    let _ = conn.tx.try_send(Outbound::Frame(json!({
                        "type": "queued_message_sent",
                        "originalTimestamp": entry.message["timestamp"].clone(),
                        "messageType": entry.message["type"].clone(),
                        "timestamp": now_ms(),
                    })));
                }
            } else {
                entry.retries += 1;
                debug!(
                    device_id = %device_id,
                    retries = entry.retries,
                    "Dropped pending message after failed flush send"
                );
            }
        }
    }

    /// Arm (or re-arm) the one-shot `token_expiring` warning for a session.
    /// Any previously scheduled timer is aborted first.
    async fn schedule_expiry_warning(&self, conn: &Arc<ClientConnection>) {
        let expires_ms = conn.token_expires_ms.load(Ordering::Relaxed);
        let warn_at_ms = expires_ms - self.cfg.token_warning_secs * 1000;
        let delay = Duration::from_millis(warn_at_ms.saturating_sub(now_ms()).max(0) as u64);

        let handle = Arc::clone(conn);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let expires_ms = handle.token_expires_ms.load(Ordering::Relaxed);
            let expires_in_secs = ((expires_ms - now_ms()) / 1000).max(0);
            // try_send fails silently once the socket is gone.
            let _ = handle.tx.try_send(Outbound::Frame(json!({
                "type": "token_expiring",
                "expiresAt": expires_ms,
                "expiresIn": expires_in_secs,
                "refreshRequired": true,
                "timestamp": now_ms(),
            })));
        });

        let mut timer = conn.expiry_timer.lock().await;
        if let Some(prior) = timer.replace(task) {
            prior.abort();
        }
    }

    /// Keep-alive sweep: ping every client, counting silent sweeps. A client
    /// that exceeds the miss budget is terminated.
    pub async fn ping_sweep(&self) {
        let snapshot: Vec<Arc<ClientConnection>> =
            self.sessions.read().await.values().cloned().collect();
        for conn in snapshot {
            let missed = conn.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1;
            if missed > self.cfg.max_missed_pongs {
                warn!(
                    session_id = %conn.session_id,
                    missed, "Client unresponsive, terminating"
                );
                if self.remove_session(&conn.session_id).await.is_some() {
                    let _ = conn.tx.try_send(Outbound::Close {
                        code: CLOSE_NORMAL,
                        reason: "Ping timeout".to_string(),
                    });
                }
            } else {
                *conn.ping_started.lock().await = Some(Instant::now());
                let _ = conn.tx.try_send(Outbound::Ping);
            }
        }
    }

    /// Purge expired pending messages. Returns the number removed.
    pub async fn sweep_queues(&self) -> usize {
        self.queues.sweep().await
    }

    pub async fn connected_client_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Pending messages buffered for one device.
    pub async fn queued_messages(&self, device_id: &str) -> usize {
        self.queues.len(device_id).await
    }

    pub async fn stats(&self) -> Value {
        let clients_by_device: HashMap<String, usize> = self
            .by_device
            .read()
            .await
            .iter()
            .map(|(device_id, sessions)| (device_id.clone(), sessions.len()))
            .collect();
        json!({
            "connectedClients": self.sessions.read().await.len(),
            "totalConnections": self.total_connections.load(Ordering::Relaxed),
            "totalMessages": self.total_messages.load(Ordering::Relaxed),
            "uptimeMs": self.started.elapsed().as_millis() as u64,
            "queuedMessagesTotal": self.queues.total().await,
            "clientsByDevice": clients_by_device,
        })
    }

    /// Stop the fan-out task, cancel per-session timers, close every client
    /// socket, and clear both tables. Queues and caches are discarded.
    pub async fn shutdown(&self) {
        if let Some(task) = self.fanout.lock().await.take() {
            task.abort();
        }
        let mut sessions = self.sessions.write().await;
        for conn in sessions.values() {
            if let Some(timer) = conn.expiry_timer.lock().await.take() {
                timer.abort();
            }
            let _ = conn.tx.try_send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "Relay shutting down".to_string(),
            });
        }
        sessions.clear();
        self.by_device.write().await.clear();
    }

    /// Remove a session from both tables and cancel its expiry timer.
    async fn remove_session(&self, session_id: &str) -> Option<Arc<ClientConnection>> {
        let removed = self.sessions.write().await.remove(session_id)?;
        {
            let mut by_device = self.by_device.write().await;
            if let Some(bound) = by_device.get_mut(&removed.device_id) {
                bound.remove(session_id);
                if bound.is_empty() {
                    by_device.remove(&removed.device_id);
                }
            }
        }
        if let Some(timer) = removed.expiry_timer.lock().await.take() {
            timer.abort();
        }
        Some(removed)
    }
}

impl ClientSession {
    pub fn session_id(&self) -> &str {
        &self.conn.session_id
    }

    pub fn device_id(&self) -> &str {
        &self.conn.device_id
    }

    pub fn connected_at(&self) -> Instant {
        self.conn.connected_at
    }

    /// Epoch-ms timestamp of the last frame received from this client.
    pub fn last_activity_ms(&self) -> i64 {
        self.conn.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Record liveness: any frame from the client resets its miss counter.
    pub fn touch(&self) {
        self.conn.missed_pongs.store(0, Ordering::Relaxed);
        self.conn
            .last_activity_ms
            .store(now_ms(), Ordering::Relaxed);
    }

    /// Keep-alive pong: fold the round trip into the RTT metrics.
    pub async fn handle_pong(&self) {
        let started = self.conn.ping_started.lock().await.take();
        if let Some(started) = started {
            let rtt_ms = started.elapsed().as_millis() as u64;
            let mut metrics = self.conn.metrics.lock().await;
            metrics.ping_count += 1;
            metrics.last_ping_rtt = Some(rtt_ms);
            metrics.avg_ping_rtt +=
                (rtt_ms as f64 - metrics.avg_ping_rtt) / metrics.ping_count as f64;
        }
    }

    /// One client text frame: parse, dispatch control types, forward the
    /// rest. Parse failures log a warning and drop the frame.
    pub async fn handle_text(&self, text: &str) {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                warn!(session_id = %self.conn.session_id, "Dropped non-object client frame");
                return;
            }
            Err(e) => {
                warn!(session_id = %self.conn.session_id, "Dropped unparseable client frame: {e}");
                return;
            }
        };

        match parsed["type"].as_str().unwrap_or("") {
            "refresh_auth" => self.handle_refresh_auth(&parsed).await,
            "ping" => {
                let _ = self.conn.tx.try_send(Outbound::Frame(json!({
                    "type": "pong",
                    "timestamp": now_ms(),
                    "clientTimestamp": parsed["timestamp"].clone(),
                })));
            }
            "get_metrics" => self.handle_get_metrics().await,
            _ => self.forward(parsed).await,
        }
    }

    /// In-band token refresh. The new token must verify and belong to the
    /// same user; failure replies `success: false` without closing the
    /// socket.
    async fn handle_refresh_auth(&self, msg: &Value) {
        let verdict = match msg["token"].as_str() {
            None => Err("Missing token"),
            Some(token) => match self.proxy.store.verify_access_token(token).await {
                None => Err("Invalid token"),
                Some(auth) if auth.user.id != self.conn.user_id => Err("Token user mismatch"),
                Some(auth) => Ok(auth.access_expires_at.timestamp_millis()),
            },
        };

        match verdict {
            Ok(expires_ms) => {
                self.conn
                    .token_expires_ms
                    .store(expires_ms, Ordering::Relaxed);
                self.proxy.schedule_expiry_warning(&self.conn).await;
                info!(session_id = %self.conn.session_id, "Session token refreshed");
                let _ = self.conn.tx.try_send(Outbound::Frame(json!({
                    "type": "auth_refreshed",
                    "success": true,
                    "tokenExpiresAt": expires_ms,
                    "timestamp": now_ms(),
                })));
            }
            Err(reason) => {
                warn!(session_id = %self.conn.session_id, reason, "Token refresh rejected");
                let _ = self.conn.tx.try_send(Outbound::Frame(json!({
                    "type": "auth_refreshed",
                    "success": false,
                    "reason": reason,
                    "timestamp": now_ms(),
                })));
            }
        }
    }

    async fn handle_get_metrics(&self) {
        let metrics = self.conn.metrics.lock().await.clone();
        let device_online = self.proxy.relay.is_device_connected(&self.conn.device_id).await;
        let queued = self.proxy.queues.len(&self.conn.device_id).await;
        let _ = self.conn.tx.try_send(Outbound::Frame(json!({
            "type": "metrics",
            "connection": serde_json::to_value(&metrics).unwrap_or(Value::Null),
            "deviceOnline": device_online,
            "queuedMessages": queued,
            "timestamp": now_ms(),
        })));
    }

    /// Stamp and forward a client message to the bound device, or buffer it
    /// and tell the client when the device is offline.
    async fn forward(&self, mut message: Value) {
        if let Some(obj) = message.as_object_mut() {
            obj.insert("timestamp".to_string(), json!(now_ms()));
        }
        let device_id = &self.conn.device_id;

        if self
            .proxy
            .relay
            .send_to_device(device_id, message.clone())
            .await
        {
            self.conn.metrics.lock().await.messages_sent += 1;
            self.proxy.total_messages.fetch_add(1, Ordering::Relaxed);
        } else {
            let queued = self
                .proxy
                .queues
                .enqueue(device_id, message, &self.conn.session_id)
                .await;
            let _ = self.conn.tx.try_send(Outbound::Frame(json!({
                "type": "device_status",
                "online": false,
                "lastSeen": self.proxy.relay.device_last_seen(device_id).await,
                "messageQueued": true,
                "queuedMessages": queued,
                "queueTTL": self.proxy.queues.ttl().as_secs(),
                "timestamp": now_ms(),
            })));
        }
    }

    /// Close path: drop the session from both tables and cancel its timer.
    pub async fn finish(self) {
        if self
            .proxy
            .remove_session(&self.conn.session_id)
            .await
            .is_some()
        {
            info!(session_id = %self.conn.session_id, "Client disconnected");
        }
    }
}

/// Query parameters for the client WebSocket upgrade.
#[derive(Deserialize)]
pub struct ClientWsQuery {
    pub token: Option<String>,
    pub device: Option<String>,
}

/// `GET /ws?token=<access token>&device=<BRW-...>` — client WebSocket
/// upgrade.
pub async fn client_ws(
    State(state): State<AppState>,
    Query(query): Query<ClientWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, query))
}

async fn handle_client_socket(socket: WebSocket, state: AppState, query: ClientWsQuery) {
    let (session, rx) = match state.proxy.connect(query.token, query.device).await {
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
            Message::Text(text) => session.handle_text(&text).await,
            Message::Pong(_) => session.handle_pong().await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    session.finish().await;
    send_task.abort();
}
