//! Capital snapshot types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Point-in-time view of one subaccount inside a [`CapitalSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubaccountSnapshot {
    pub bot_id: Uuid,
    pub index: i16,
    /// Last known balance. When `stale` is set this is the prior cached
    /// value, not a fresh read.
    pub balance: Decimal,
    /// Whether the subaccount exists on-chain. A bot can expect a
    /// subaccount that is absent on the ledger; that mismatch is
    /// surfaced here, never coerced.
    pub exists: bool,
    /// Set when the authoritative read failed (or the subaccount's saga is
    /// in flight) and the cached value was reused.
    pub stale: bool,
}

/// A derived, point-in-time read of total custody value, split by location.
///
/// Never persisted as truth; always recomputed. Writers publish a fresh
/// snapshot wholesale so readers cannot observe a half-updated split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalSnapshot {
    pub agent_wallet_id: Uuid,
    /// Balance sitting in the agent wallet's main account.
    pub available_balance: Decimal,
    /// Sum of all subaccount balances (capital deployed to bots).
    pub deployed_balance: Decimal,
    /// `available_balance + deployed_balance` at the moment of the read.
    pub total_equity: Decimal,
    /// Set when the wallet's main balance read failed and the cached
    /// figure was reused.
    pub available_stale: bool,
    pub subaccounts: Vec<SubaccountSnapshot>,
    pub last_updated: DateTime<Utc>,
}

impl CapitalSnapshot {
    /// Whether any figure in this snapshot came from cache instead of a
    /// fresh ledger read.
    pub fn has_stale_figures(&self) -> bool {
        self.available_stale || self.subaccounts.iter().any(|s| s.stale)
    }
}
