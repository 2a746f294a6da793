// =============================================================================
// Admin API Module
// =============================================================================
//
// Small HTTP surface: a public health probe plus bearer-authenticated
// endpoints for per-agent start/stop/run/interval and the orchestrator
// snapshots (state, regime, uncertainty, governor, allocator, findings).

pub mod auth;
pub mod rest;

pub use rest::{router, ApiContext};
