//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require authentication via the
//! [`crate::auth::require_admin_key`] middleware.

pub mod admin;
pub mod health;
pub mod logs;
