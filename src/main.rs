#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # brewlink
//!
//! Cloud relay bridging espresso machines and authenticated end-user
//! clients over WebSocket.
//!
//! Machines keep a persistent outbound connection to the relay; clients
//! connect with a session token and a target device id. The relay routes
//! control messages client→device and streams telemetry device→clients,
//! buffering briefly while a machine is offline and hydrating new clients
//! from cached state.
//!
//! ## API surface
//!
//! | Method | Path                                   | Auth        | Description                    |
//! |--------|----------------------------------------|-------------|--------------------------------|
//! | GET    | `/api/health`                          | No          | Liveness probe                 |
//! | GET    | `/api/stats`                           | admin key   | Relay + proxy counters         |
//! | GET    | `/api/devices`                         | admin key   | Connected device list          |
//! | POST   | `/api/devices/{id}/disconnect`         | admin key   | Force-close a device (4000)    |
//! | GET    | `/api/devices/{id}/logs/info`          | admin key   | Proxied log-capture status     |
//! | GET    | `/api/devices/{id}/logs`               | admin key   | Proxied log fetch              |
//! | DELETE | `/api/devices/{id}/logs`               | admin key   | Proxied log clear              |
//! | POST   | `/api/devices/{id}/logs/enabled`       | admin key   | Proxied capture toggle         |
//! | POST   | `/api/devices/{id}/logs/pico-forwarding` | admin key | Proxied controller-log toggle  |
//! | POST   | `/api/devices/{id}/logs/debug`         | admin key   | Proxied debug-log toggle       |
//! | GET    | `/ws/device?id=&key=`                  | device key  | Machine WebSocket              |
//! | GET    | `/ws?token=&device=`                   | session token | Client WebSocket             |
//!
//! ## Architecture
//!
//! ```text
//! main.rs           — entry point, clap, router setup, sweeps, graceful shutdown
//! auth.rs           — admin Bearer middleware, constant-time comparison
//! config.rs         — TOML + env-var configuration
//! store.rs          — credential/ownership store seam + in-memory impl
//! state.rs          — AppState
//! routes/
//!   health.rs       — GET /api/health
//!   admin.rs        — stats, device list, forced disconnect
//!   logs.rs         — log-capture proxies over the request protocol
//! relay/
//!   mod.rs          — close codes, per-socket outbound channel, pumps
//!   codec.rs        — MessagePack multi-decode, legacy JSON, id validation
//!   device.rs       — device registry, publication, keep-alive, reconcile
//!   proxy.rs        — client sessions, fan-out, control types, keep-alive
//!   queue.rs        — per-device pending-message FIFO (cap 50, TTL 10 s)
//!   cache.rs        — per-device state snapshots for client hydration
//!   request.rs      — awaitable RPC to devices (requestId correlation)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use brewlink::relay::{device, proxy};
use brewlink::{auth, routes, AdminKey, AppState, ClientProxy, Config, DeviceRelay, MemoryStore};

/// Cloud relay for espresso machines and their clients.
#[derive(Parser)]
#[command(name = "brewlink", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("brewlink v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.admin_key == "change-me" {
        warn!("Using default admin key — set BREWLINK_ADMIN_KEY or update config");
    }

    let device_keys: HashMap<String, String> = config
        .devices
        .as_ref()
        .map(|d| d.keys.clone())
        .unwrap_or_default();
    if device_keys.is_empty() {
        warn!("No [devices] table configured — no device can authenticate against the built-in store");
    }
    let store = Arc::new(MemoryStore::with_device_keys(device_keys));

    let relay = DeviceRelay::new(store.clone(), config.relay.clone());
    let relay_proxy: Arc<ClientProxy> =
        ClientProxy::new(Arc::clone(&relay), store.clone(), config.proxy.clone());
    relay_proxy.start().await;

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        store,
        relay: Arc::clone(&relay),
        proxy: Arc::clone(&relay_proxy),
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/stats", get(routes::admin::stats))
        .route("/api/devices", get(routes::admin::list_devices))
        .route(
            "/api/devices/{id}/disconnect",
            post(routes::admin::disconnect_device),
        )
        .route("/api/devices/{id}/logs/info", get(routes::logs::get_log_info))
        .route(
            "/api/devices/{id}/logs",
            get(routes::logs::get_logs).delete(routes::logs::clear_logs),
        )
        .route(
            "/api/devices/{id}/logs/enabled",
            post(routes::logs::set_log_enabled),
        )
        .route(
            "/api/devices/{id}/logs/pico-forwarding",
            post(routes::logs::set_pico_log_forwarding),
        )
        .route(
            "/api/devices/{id}/logs/debug",
            post(routes::logs::set_debug_logs_enabled),
        )
        .layer(middleware::from_fn(auth::require_admin_key));

    let ws_routes = Router::new()
        .route("/ws", get(proxy::client_ws))
        .route("/ws/device", get(device::device_ws));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(AdminKey(state.config.auth.admin_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Device keep-alive sweep (10 s cadence — lossy radios need tight liveness)
    let sweep_relay = Arc::clone(&relay);
    let device_ping_secs = state.config.relay.ping_interval_secs;
    let device_ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(device_ping_secs));
        loop {
            interval.tick().await;
            sweep_relay.ping_sweep().await;
        }
    });

    // Persisted online-flag reconciliation (covers crashes and missed closes)
    let reconcile_relay = Arc::clone(&relay);
    let reconcile_secs = state.config.relay.reconcile_interval_secs;
    let reconcile_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(reconcile_secs));
        loop {
            interval.tick().await;
            reconcile_relay.reconcile().await;
        }
    });

    // Client keep-alive sweep (30 s cadence — browsers are costlier to ping)
    let sweep_proxy = Arc::clone(&relay_proxy);
    let client_ping_secs = state.config.proxy.ping_interval_secs;
    let client_ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(client_ping_secs));
        loop {
            interval.tick().await;
            sweep_proxy.ping_sweep().await;
        }
    });

    // Pending-queue TTL sweep
    let queue_proxy = Arc::clone(&relay_proxy);
    let queue_sweep_secs = state.config.proxy.queue_sweep_secs;
    let queue_sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(queue_sweep_secs));
        loop {
            interval.tick().await;
            queue_proxy.sweep_queues().await;
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup: cancel timers, close sockets, discard queues and caches
    info!("Shutting down...");
    device_ping_task.abort();
    reconcile_task.abort();
    client_ping_task.abort();
    queue_sweep_task.abort();

    relay_proxy.shutdown().await;
    relay.shutdown().await;
    info!("Goodbye");
}
