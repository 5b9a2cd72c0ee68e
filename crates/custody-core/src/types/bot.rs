//! Trading bot types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SubaccountRef;

/// A user-configured strategy binding.
///
/// The bot weakly references at most one subaccount: a lookup, not
/// ownership. Deleting the bot record is gated by the lifecycle saga
/// whenever funds are present so an on-chain subaccount is never left
/// unaccounted for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingBot {
    pub id: Uuid,
    pub agent_wallet_id: Uuid,
    pub name: String,
    pub active: bool,
    pub leverage: Decimal,
    /// Index of the dedicated subaccount, if one was provisioned.
    pub subaccount_index: Option<i16>,
    /// For bots created under the superseded custody scheme: the address
    /// their funds actually sit in. The coordinator cannot sweep it.
    pub legacy_address: Option<String>,
    /// Equity figure derived from cached trade statistics. Reconciled
    /// against the ledger by the reconciliation poller.
    pub cached_equity: Decimal,
    pub stats_synced_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TradingBot {
    /// Whether the bot pre-dates sub-account isolation.
    pub fn is_legacy(&self) -> bool {
        self.subaccount_index.is_none() && self.legacy_address.is_some()
    }

    /// The bot's subaccount reference under the given wallet address.
    pub fn subaccount(&self, wallet_address: &str) -> Option<SubaccountRef> {
        self.subaccount_index.map(|index| SubaccountRef {
            wallet_address: wallet_address.to_string(),
            index,
        })
    }
}

/// An open position on a venue subaccount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    /// Venue-assigned position identifier.
    pub position_id: String,
    /// Market the position is in.
    pub market: String,
    /// Signed base quantity; negative for shorts.
    pub base_quantity: Decimal,
    /// Unrealized profit/loss in the settlement asset.
    pub unrealized_pnl: Decimal,
}
