//! Agent wallet types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Custodial wallet controlled by the service on the user's behalf.
///
/// One per user. Never deleted, only rotated: the old row is stamped
/// `rotated_at` and a fresh identity takes over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWallet {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Public address of the custodial wallet.
    pub address: String,
    /// The user's own wallet address; destination for full withdrawals.
    pub external_address: String,
    /// Cached available balance. Authoritative value lives on the ledger.
    pub available_balance: Decimal,
    /// When the cached balance was last synced against the ledger.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Set when the wallet was rotated out and abandoned.
    pub rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AgentWallet {
    /// Whether this wallet is the live custodial identity.
    pub fn is_active(&self) -> bool {
        self.rotated_at.is_none()
    }
}

/// Reference to an isolated per-bot ledger entry on the trading venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubaccountRef {
    /// Owning agent wallet address.
    pub wallet_address: String,
    /// Numeric index of the subaccount under that wallet.
    pub index: i16,
}

impl std::fmt::Display for SubaccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.wallet_address, self.index)
    }
}
