//! Venue-facing interface seams.
//!
//! The coordinator consumes the trading venue through these traits; the
//! concrete HTTP clients live in [`http`], and tests substitute in-memory
//! fakes. All monetary figures are authoritative ledger reads, never
//! cached values.

pub mod http;

use crate::types::{OpenPosition, SignedTransaction, SubaccountRef};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Balance report for one subaccount.
///
/// `exists` distinguishes "zero balance" from "account does not exist";
/// callers must not collapse the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountBalance {
    pub balance: Decimal,
    pub exists: bool,
}

/// What kind of transaction the build service should assemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntentKind {
    /// Withdraw a subaccount's full balance to the agent wallet.
    WithdrawSubaccount { subaccount: SubaccountRef },
    /// Withdraw from the agent wallet's main balance to an external address.
    WithdrawMain {
        wallet_address: String,
        destination: String,
        amount: Decimal,
    },
    /// Transfer residual native-asset balance between wallets.
    TransferNative {
        from: String,
        to: String,
        amount: Decimal,
    },
}

/// An unsigned transaction plus the metadata needed to confirm it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedIntent {
    /// Serialized unsigned transaction for the external signer.
    pub unsigned_tx: String,
    /// Opaque hints passed back to the gateway when confirming.
    pub confirmation_hints: serde_json::Value,
}

/// Receipt from submitting a signed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub tx_signature: String,
}

/// Status of a submitted transaction as reported by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    Confirmed,
    Pending,
    Failed { reason: String },
    /// The ledger does not know the signature (yet).
    Unknown,
}

/// Read-only balance and position queries. Eventually consistent.
#[async_trait]
pub trait LedgerQuery: Send + Sync {
    /// Balance of one subaccount, with existence made explicit.
    async fn subaccount_balance(&self, subaccount: &SubaccountRef) -> Result<SubaccountBalance>;

    /// Main (available) balance of a wallet in the settlement asset.
    async fn wallet_balance(&self, address: &str) -> Result<Decimal>;

    /// Native-asset balance of a wallet (gas/deposit currency).
    async fn native_balance(&self, address: &str) -> Result<Decimal>;

    /// Open positions on one subaccount.
    async fn open_positions(&self, subaccount: &SubaccountRef) -> Result<Vec<OpenPosition>>;

    /// Status of a submitted transaction.
    async fn transaction_status(
        &self,
        tx_signature: &str,
        confirmation_hints: &serde_json::Value,
    ) -> Result<TxStatus>;
}

/// Transaction build service. Deterministic for identical params; safe to
/// call multiple times for the same intent.
#[async_trait]
pub trait IntentBuilder: Send + Sync {
    async fn build_intent(&self, kind: IntentKind) -> Result<UnsignedIntent>;
}

/// Submission path for signed transactions.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    async fn submit(&self, signed_tx: &SignedTransaction) -> Result<SubmitReceipt>;
}

/// Venue operations the agent performs under its own authority — no
/// external signature involved.
#[async_trait]
pub trait VenueOps: Send + Sync {
    /// Close one open position on a subaccount.
    async fn close_position(&self, subaccount: &SubaccountRef, position_id: &str) -> Result<()>;

    /// Realize unrealized P&L on a subaccount into the settlement asset.
    async fn settle_pnl(&self, subaccount: &SubaccountRef) -> Result<()>;

    /// Move a subaccount's full balance into the owning wallet's main
    /// balance. Returns the amount swept.
    async fn sweep_to_main(&self, subaccount: &SubaccountRef) -> Result<Decimal>;

    /// Remove an empty subaccount ledger entry, reclaiming any deposit
    /// held for its existence. Returns the reclaimed amount.
    async fn close_subaccount(&self, subaccount: &SubaccountRef) -> Result<Decimal>;

    /// Provision a fresh custodial wallet identity for a user.
    async fn provision_wallet(&self, user_id: Uuid) -> Result<String>;
}

/// How the external signer answered a signature request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureOutcome {
    Signed(SignedTransaction),
    Rejected,
}

/// The external, user-controlled signer.
///
/// `await_signature` suspends until the user acts — there is no
/// system-imposed timeout; the wait is cancellable only by rejection or
/// by abandoning the operation.
#[async_trait]
pub trait SignatureGateway: Send + Sync {
    async fn await_signature(
        &self,
        operation_id: Uuid,
        unsigned_tx: &str,
    ) -> Result<SignatureOutcome>;
}
