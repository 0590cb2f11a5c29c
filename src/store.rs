//! Credential and ownership store seam.
//!
//! The account service (OAuth login, device pairing, persisted device rows)
//! lives outside this crate. The relay plane only consumes the five
//! operations below, so they are expressed as a trait object and injected at
//! startup. Deployments wire in their own implementation; `MemoryStore` backs
//! local development and every test.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

/// Authenticated user identity attached to a session token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

/// A verified session: who it belongs to and when its access token expires.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user: AuthUser,
    pub access_expires_at: DateTime<Utc>,
}

/// Operations the relay consumes from the account service.
///
/// Failures on the status-update paths are advisory: callers log and
/// continue, they never abort a connection event.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Check a device's pre-shared secret key.
    async fn verify_device_key(&self, device_id: &str, key: &str) -> bool;

    /// Resolve a session access token. `None` means invalid or expired.
    async fn verify_access_token(&self, token: &str) -> Option<AuthSession>;

    /// Whether `user_id` has paired (owns) `device_id`.
    async fn user_owns_device(&self, user_id: &str, device_id: &str) -> bool;

    /// Persist a device's online/offline flag.
    async fn update_device_status(&self, device_id: &str, online: bool) -> Result<(), String>;

    /// Mark any device flagged online in persistence but absent from
    /// `connected` as offline. Returns the number of stale rows fixed.
    async fn sync_online_devices(&self, connected: &HashSet<String>) -> Result<usize, String>;
}

/// In-memory credential store for development and tests.
///
/// Device keys come from the `[devices]` config table; tokens and ownership
/// rows are inserted at runtime.
#[derive(Default)]
pub struct MemoryStore {
    device_keys: RwLock<HashMap<String, String>>,
    sessions: RwLock<HashMap<String, AuthSession>>,
    ownership: RwLock<HashMap<String, HashSet<String>>>,
    online_flags: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a device id → key table (ids are canonicalized uppercase).
    pub fn with_device_keys(keys: HashMap<String, String>) -> Self {
        let store = Self::new();
        {
            let mut table = store.device_keys.try_write().expect("fresh lock");
            for (id, key) in keys {
                table.insert(id.to_ascii_uppercase(), key);
            }
        }
        store
    }

    /// Register a device key.
    pub async fn insert_device_key(&self, device_id: &str, key: &str) {
        self.device_keys
            .write()
            .await
            .insert(device_id.to_ascii_uppercase(), key.to_string());
    }

    /// Register a session token.
    pub async fn insert_token(
        &self,
        token: &str,
        user_id: &str,
        email: &str,
        access_expires_at: DateTime<Utc>,
    ) {
        self.sessions.write().await.insert(
            token.to_string(),
            AuthSession {
                user: AuthUser {
                    id: user_id.to_string(),
                    email: email.to_string(),
                },
                access_expires_at,
            },
        );
    }

    /// Record that a user owns a device.
    pub async fn insert_ownership(&self, user_id: &str, device_id: &str) {
        self.ownership
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(device_id.to_ascii_uppercase());
    }

    /// Whether the persisted online flag is set (test observability).
    pub async fn is_flagged_online(&self, device_id: &str) -> bool {
        self.online_flags.read().await.contains(device_id)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn verify_device_key(&self, device_id: &str, key: &str) -> bool {
        self.device_keys
            .read()
            .await
            .get(device_id)
            .is_some_and(|expected| crate::auth::secrets_match(expected.as_bytes(), key.as_bytes()))
    }

    async fn verify_access_token(&self, token: &str) -> Option<AuthSession> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(token)?;
        if session.access_expires_at <= Utc::now() {
            return None;
        }
        Some(session.clone())
    }

    async fn user_owns_device(&self, user_id: &str, device_id: &str) -> bool {
        self.ownership
            .read()
            .await
            .get(user_id)
            .is_some_and(|devices| devices.contains(device_id))
    }

    async fn update_device_status(&self, device_id: &str, online: bool) -> Result<(), String> {
        let mut flags = self.online_flags.write().await;
        if online {
            flags.insert(device_id.to_string());
        } else {
            flags.remove(device_id);
        }
        Ok(())
    }

    async fn sync_online_devices(&self, connected: &HashSet<String>) -> Result<usize, String> {
        let mut flags = self.online_flags.write().await;
        let stale: Vec<String> = flags.difference(connected).cloned().collect();
        let count = stale.len();
        for id in stale {
            flags.remove(&id);
        }
        if count > 0 {
            debug!(count, "Reconciled stale online flags");
        }
        Ok(count)
    }
}
