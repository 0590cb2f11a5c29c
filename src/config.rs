//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `BREWLINK_ADMIN_KEY`, `BREWLINK_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `brewlink.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [auth]
//! admin_key = "your-secret-key"
//!
//! [relay]
//! ping_interval_secs = 10
//! max_missed_pings = 2
//! reconcile_interval_secs = 60
//!
//! [proxy]
//! ping_interval_secs = 30
//! max_missed_pongs = 2
//! queue_capacity = 50
//! queue_ttl_secs = 10
//!
//! [logging]
//! level = "info"
//!
//! # Optional — device key table for the built-in in-memory credential store
//! [devices]
//! keys = { "BRW-01ABCDEF" = "0123456789abcdef0123456789abcdef" }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional device key table consumed by the in-memory credential store.
    pub devices: Option<DevicesConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings for the admin REST surface.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token for `/api/*` routes. Override with
    /// `BREWLINK_ADMIN_KEY`. Defaults to `"change-me"` which triggers a
    /// startup warning.
    #[serde(default = "default_admin_key")]
    pub admin_key: String,
}

/// Device-side relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Seconds between device keep-alive ping sweeps (default 10).
    #[serde(default = "default_device_ping_interval")]
    pub ping_interval_secs: u64,
    /// Consecutive missed sweeps tolerated before termination (default 2).
    #[serde(default = "default_max_missed")]
    pub max_missed_pings: u32,
    /// Seconds between persisted online-flag reconciliation runs (default 60).
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Minimum accepted device key length (default 32).
    #[serde(default = "default_min_key_len")]
    pub min_key_len: usize,
    /// Maximum accepted device key length (default 64).
    #[serde(default = "default_max_key_len")]
    pub max_key_len: usize,
}

/// Client-side proxy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Seconds between client keep-alive ping sweeps (default 30).
    #[serde(default = "default_client_ping_interval")]
    pub ping_interval_secs: u64,
    /// Consecutive missed sweeps tolerated before termination (default 2).
    #[serde(default = "default_max_missed")]
    pub max_missed_pongs: u32,
    /// Maximum pending messages buffered per offline device (default 50).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds a pending message stays deliverable (default 10).
    #[serde(default = "default_queue_ttl")]
    pub queue_ttl_secs: u64,
    /// Seconds between expired-entry sweeps of the pending queues (default 10).
    #[serde(default = "default_queue_sweep")]
    pub queue_sweep_secs: u64,
    /// Cache age beyond which a newly hydrated client triggers a state
    /// refetch from the device (default 10).
    #[serde(default = "default_cache_stale")]
    pub cache_stale_secs: u64,
    /// Seconds before token expiry at which `token_expiring` is sent
    /// (default 300).
    #[serde(default = "default_token_warning")]
    pub token_warning_secs: i64,
    /// Timeout for awaited cloud→device requests (default 10).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Device key table for the built-in in-memory credential store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicesConfig {
    /// Map of device id → secret key.
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_key() -> String {
    "change-me".to_string()
}
fn default_device_ping_interval() -> u64 {
    10
}
fn default_client_ping_interval() -> u64 {
    30
}
fn default_max_missed() -> u32 {
    2
}
fn default_reconcile_interval() -> u64 {
    60
}
fn default_min_key_len() -> usize {
    32
}
fn default_max_key_len() -> usize {
    64
}
fn default_queue_capacity() -> usize {
    50
}
fn default_queue_ttl() -> u64 {
    10
}
fn default_queue_sweep() -> u64 {
    10
}
fn default_cache_stale() -> u64 {
    10
}
fn default_token_warning() -> i64 {
    300
}
fn default_request_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_key: default_admin_key(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_device_ping_interval(),
            max_missed_pings: default_max_missed(),
            reconcile_interval_secs: default_reconcile_interval(),
            min_key_len: default_min_key_len(),
            max_key_len: default_max_key_len(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_client_ping_interval(),
            max_missed_pongs: default_max_missed(),
            queue_capacity: default_queue_capacity(),
            queue_ttl_secs: default_queue_ttl(),
            queue_sweep_secs: default_queue_sweep(),
            cache_stale_secs: default_cache_stale(),
            token_warning_secs: default_token_warning(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            relay: RelayConfig::default(),
            proxy: ProxyConfig::default(),
            logging: LoggingConfig::default(),
            devices: None,
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `brewlink.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("brewlink.toml").exists() {
            let content =
                std::fs::read_to_string("brewlink.toml").expect("Failed to read brewlink.toml");
            toml::from_str(&content).expect("Failed to parse brewlink.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("BREWLINK_ADMIN_KEY") {
            config.auth.admin_key = key;
        }
        if let Ok(listen) = std::env::var("BREWLINK_LISTEN") {
            config.server.listen = listen;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.relay.ping_interval_secs, 10);
        assert_eq!(c.relay.max_missed_pings, 2);
        assert_eq!(c.relay.reconcile_interval_secs, 60);
        assert_eq!(c.proxy.ping_interval_secs, 30);
        assert_eq!(c.proxy.queue_capacity, 50);
        assert_eq!(c.proxy.queue_ttl_secs, 10);
        assert_eq!(c.proxy.token_warning_secs, 300);
        assert_eq!(c.proxy.request_timeout_secs, 10);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let c: Config = toml::from_str(
            r#"
            [auth]
            admin_key = "secret"

            [devices]
            keys = { "BRW-01ABCDEF" = "0123456789abcdef0123456789abcdef" }
            "#,
        )
        .unwrap();
        assert_eq!(c.auth.admin_key, "secret");
        assert_eq!(c.server.listen, "0.0.0.0:8080");
        assert_eq!(c.proxy.cache_stale_secs, 10);
        assert_eq!(c.devices.unwrap().keys.len(), 1);
    }
}
