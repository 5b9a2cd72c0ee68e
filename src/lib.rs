//! Agent Custody: capital custody lifecycle coordinator.
//!
//! This is the root crate that hosts the cross-crate integration tests.
//! For actual functionality, use the individual crates directly:
//!
//! - `custody-core`: Core types, venue clients, database models
//! - `lifecycle-engine`: Delete/reset/rotation sagas, confirmation plumbing
//! - `equity-monitor`: Equity aggregation, cache reconciliation
//! - `api-server`: REST/WebSocket API server

pub use custody_core as core;
pub use equity_monitor as monitor;
pub use lifecycle_engine as engine;
