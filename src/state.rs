//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::relay::device::DeviceRelay;
use crate::relay::proxy::ClientProxy;
use crate::store::CredentialStore;

/// Shared application state for the brewlink relay.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Credential/ownership store (external account service seam).
    pub store: Arc<dyn CredentialStore>,
    /// Device registry and publication.
    pub relay: Arc<DeviceRelay>,
    /// Client sessions, fan-out, queues, cache.
    pub proxy: Arc<ClientProxy>,
}
