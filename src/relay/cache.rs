//! Per-device state cache.
//!
//! Machines stream a full `status` roughly every 500 ms plus occasional
//! `device_info` / `esp_status` / `pico_status` snapshots. The proxy keeps
//! the most recent of each so a newly connecting client can be hydrated
//! immediately instead of waiting out the stream interval. `status_delta`
//! messages refresh the freshness clock only — deltas are applied
//! client-side, so storing one here would hand later clients a stale
//! snapshot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

/// Cached snapshot frames for one device.
#[derive(Default)]
struct DeviceSnapshot {
    status: Option<Value>,
    device_info: Option<Value>,
    esp_status: Option<Value>,
    pico_status: Option<Value>,
    last_updated: Option<Instant>,
}

impl DeviceSnapshot {
    fn has_data(&self) -> bool {
        self.status.is_some()
            || self.device_info.is_some()
            || self.esp_status.is_some()
            || self.pico_status.is_some()
    }
}

/// All device snapshots, keyed by device id. Written by the publication
/// handler, read on client connect.
#[derive(Default)]
pub struct StateCache {
    entries: RwLock<HashMap<String, DeviceSnapshot>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a device publication into the cache. Full snapshot types replace
    /// their slot; `status_delta` advances freshness only. Returns whether
    /// the message touched the cache.
    pub async fn apply(&self, device_id: &str, message: &Value) -> bool {
        let slot = match message["type"].as_str() {
            Some(t @ ("status" | "device_info" | "esp_status" | "pico_status")) => Some(t),
            Some("status_delta") => None,
            _ => return false,
        };

        let mut entries = self.entries.write().await;
        let entry = entries.entry(device_id.to_string()).or_default();
        match slot {
            Some("status") => entry.status = Some(message.clone()),
            Some("device_info") => entry.device_info = Some(message.clone()),
            Some("esp_status") => entry.esp_status = Some(message.clone()),
            Some("pico_status") => entry.pico_status = Some(message.clone()),
            _ => {} // status_delta: freshness only
        }
        entry.last_updated = Some(Instant::now());
        true
    }

    /// Whether at least one snapshot frame is cached for the device.
    pub async fn has_data(&self, device_id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(device_id)
            .is_some_and(DeviceSnapshot::has_data)
    }

    /// Age of the newest cache write for the device.
    pub async fn age(&self, device_id: &str) -> Option<Duration> {
        self.entries
            .read()
            .await
            .get(device_id)
            .and_then(|e| e.last_updated)
            .map(|at| at.elapsed())
    }

    /// Cached frames in hydration order: `status`, `device_info`,
    /// `esp_status`, `pico_status`; absent slots are omitted.
    pub async fn hydration_frames(&self, device_id: &str) -> Vec<Value> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(device_id) else {
            return Vec::new();
        };
        [
            &entry.status,
            &entry.device_info,
            &entry.esp_status,
            &entry.pico_status,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    /// Erase a device's snapshot (the device went offline).
    pub async fn clear(&self, device_id: &str) {
        self.entries.write().await.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DEV: &str = "BRW-01ABCDEF";

    #[tokio::test]
    async fn test_full_types_replace_slots() {
        let cache = StateCache::new();
        cache.apply(DEV, &json!({"type": "status", "boiler_temp": 90})).await;
        cache.apply(DEV, &json!({"type": "status", "boiler_temp": 93})).await;
        cache.apply(DEV, &json!({"type": "esp_status", "rssi": -61})).await;

        let frames = cache.hydration_frames(DEV).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "status");
        assert_eq!(frames[0]["boiler_temp"], 93);
        assert_eq!(frames[1]["type"], "esp_status");
    }

    #[tokio::test]
    async fn test_hydration_order_is_fixed() {
        let cache = StateCache::new();
        cache.apply(DEV, &json!({"type": "pico_status"})).await;
        cache.apply(DEV, &json!({"type": "device_info"})).await;
        cache.apply(DEV, &json!({"type": "status"})).await;

        let types: Vec<String> = cache
            .hydration_frames(DEV)
            .await
            .iter()
            .map(|f| f["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["status", "device_info", "pico_status"]);
    }

    #[tokio::test]
    async fn test_delta_advances_freshness_without_storing() {
        let cache = StateCache::new();
        cache.apply(DEV, &json!({"type": "status", "boiler_temp": 90})).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stale_age = cache.age(DEV).await.unwrap();
        cache.apply(DEV, &json!({"type": "status_delta", "boiler_temp": 91})).await;
        let fresh_age = cache.age(DEV).await.unwrap();

        assert!(fresh_age < stale_age);
        // The stored status is untouched.
        let frames = cache.hydration_frames(DEV).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["boiler_temp"], 90);
    }

    #[tokio::test]
    async fn test_delta_alone_is_not_data() {
        let cache = StateCache::new();
        cache.apply(DEV, &json!({"type": "status_delta"})).await;
        assert!(!cache.has_data(DEV).await);
        assert!(cache.hydration_frames(DEV).await.is_empty());
    }

    #[tokio::test]
    async fn test_non_cached_types_ignored() {
        let cache = StateCache::new();
        assert!(!cache.apply(DEV, &json!({"type": "brew_complete"})).await);
        assert!(cache.age(DEV).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_erases_snapshot() {
        let cache = StateCache::new();
        cache.apply(DEV, &json!({"type": "status"})).await;
        cache.clear(DEV).await;
        assert!(!cache.has_data(DEV).await);
        assert!(cache.age(DEV).await.is_none());
    }
}
