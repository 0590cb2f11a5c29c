//! Shared fixtures for the relay integration tests.
//!
//! These tests exercise the device relay and client proxy through their
//! session APIs, without performing HTTP upgrades: `connect` returns the
//! registered session plus the receiver half of its outbound channel, which
//! stands in for the socket.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use brewlink::config::{ProxyConfig, RelayConfig};
use brewlink::relay::device::DeviceRelay;
use brewlink::relay::proxy::ClientProxy;
use brewlink::relay::Outbound;
use brewlink::MemoryStore;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

pub const DEVICE: &str = "BRW-01ABCDEF";
pub const DEVICE_KEY: &str = "0123456789abcdef0123456789abcdef";
pub const USER: &str = "user-1";
pub const TOKEN: &str = "token-1";

/// Store with one device, one user owning it, and one valid token.
pub async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_device_key(DEVICE, DEVICE_KEY).await;
    store
        .insert_token(
            TOKEN,
            USER,
            "user@example.com",
            Utc::now() + ChronoDuration::minutes(30),
        )
        .await;
    store.insert_ownership(USER, DEVICE).await;
    store
}

pub fn new_relay(store: Arc<MemoryStore>) -> Arc<DeviceRelay> {
    DeviceRelay::new(store, RelayConfig::default())
}

/// Proxy with the fan-out task running.
pub async fn new_proxy(
    relay: Arc<DeviceRelay>,
    store: Arc<MemoryStore>,
    cfg: ProxyConfig,
) -> Arc<ClientProxy> {
    let proxy = ClientProxy::new(relay, store, cfg);
    proxy.start().await;
    proxy
}

/// Next JSON frame from an outbound channel, skipping pings. Panics after
/// 500 ms.
pub async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Value {
    loop {
        let out = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound channel closed");
        match out {
            Outbound::Frame(value) => return value,
            Outbound::Raw(text) => return serde_json::from_str(&text).unwrap(),
            Outbound::Ping => {}
            Outbound::Close { code, reason } => {
                panic!("unexpected close {code}: {reason}")
            }
        }
    }
}

/// Drain frames until one with the given `type` arrives. Panics after 1 s.
pub async fn frame_of_type(rx: &mut mpsc::Receiver<Outbound>, wanted: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let out = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for '{wanted}' frame"))
            .expect("outbound channel closed");
        match out {
            Outbound::Frame(value) if value["type"] == wanted => return value,
            Outbound::Raw(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == wanted {
                    return value;
                }
            }
            _ => {}
        }
    }
}

/// Assert that no frame of the given `type` arrives within `ms`.
pub async fn assert_no_frame_of_type(rx: &mut mpsc::Receiver<Outbound>, unwanted: &str, ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    loop {
        let Ok(received) = tokio::time::timeout_at(deadline, rx.recv()).await else {
            return; // window elapsed without the frame
        };
        let Some(out) = received else {
            return; // channel closed, nothing more can arrive
        };
        let value = match out {
            Outbound::Frame(value) => value,
            Outbound::Raw(text) => serde_json::from_str(&text).unwrap(),
            _ => continue,
        };
        assert_ne!(
            value["type"], unwanted,
            "received unwanted '{unwanted}' frame: {value}"
        );
    }
}

/// Wait for the next Close on an outbound channel. Panics after 500 ms.
pub async fn next_close(rx: &mut mpsc::Receiver<Outbound>) -> (u16, String) {
    loop {
        let out = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timed out waiting for close")
            .expect("outbound channel closed");
        if let Outbound::Close { code, reason } = out {
            return (code, reason);
        }
    }
}

/// Let spawned tasks (fan-out, timers) run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
