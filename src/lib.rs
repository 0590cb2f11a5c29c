#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! brewlink library — the relay plane and its HTTP glue.
//!
//! Key building blocks:
//! - `relay::device` — device registry, publication, keep-alive, reconciliation
//! - `relay::proxy` — client sessions, fan-out, offline queue, state cache
//! - `relay::request` — awaitable RPC to devices for HTTP handlers
//! - `store` — credential/ownership store seam (external account service)
//! - `auth` — admin Bearer middleware
//! - `config` — configuration loading
//! - `routes` — REST API route handlers

pub mod auth;
pub mod config;
pub mod relay;
pub mod routes;
pub mod state;
pub mod store;
pub mod util;

// Re-export key types at crate root for convenience.
pub use auth::AdminKey;
pub use config::Config;
pub use relay::device::DeviceRelay;
pub use relay::proxy::ClientProxy;
pub use state::AppState;
pub use store::{CredentialStore, MemoryStore};
