//! Equity Monitor
//!
//! Read-side companions to the lifecycle engine: the equity aggregator
//! keeps a published [`CapitalSnapshot`] per agent wallet, and the
//! reconciliation poller flags drift between cached bot equity and the
//! authoritative ledger. Neither mutates custody state.
//!
//! [`CapitalSnapshot`]: custody_core::types::CapitalSnapshot

pub mod aggregator;
pub mod reconciliation;

pub use aggregator::{spawn_equity_aggregator, EquityAggregator};
pub use reconciliation::{spawn_reconciliation_poller, ReconciliationEvent, ReconciliationPoller};
