//! In-memory fakes for the store traits and venue seams.
//!
//! Used by downstream crate tests (enable the `testkit` feature). The fake
//! venue keeps one shared balance state so fund-conservation properties can
//! be asserted across saga runs.

use crate::db::{BotStore, OperationStore, WalletStore};
use crate::types::{
    AgentWallet, LifecycleOperation, OpenPosition, OperationTarget, SignedTransaction,
    SubaccountRef, TradingBot,
};
use crate::venue::{
    IntentBuilder, IntentKind, LedgerQuery, SignatureGateway, SignatureOutcome, SubaccountBalance,
    SubmitReceipt, TxStatus, UnsignedIntent, VenueGateway, VenueOps,
};
use crate::{Error, Result, VenueError};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Store fakes
// ---------------------------------------------------------------------------

/// In-memory [`WalletStore`].
#[derive(Default)]
pub struct MemoryWalletStore {
    wallets: Mutex<HashMap<Uuid, AgentWallet>>,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a wallet directly.
    pub fn add(&self, wallet: AgentWallet) {
        self.wallets.lock().unwrap().insert(wallet.id, wallet);
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn get(&self, id: Uuid) -> Result<Option<AgentWallet>> {
        Ok(self.wallets.lock().unwrap().get(&id).cloned())
    }

    async fn insert(
        &self,
        user_id: Uuid,
        address: &str,
        external_address: &str,
    ) -> Result<AgentWallet> {
        let wallet = AgentWallet {
            id: Uuid::new_v4(),
            user_id,
            address: address.to_string(),
            external_address: external_address.to_string(),
            available_balance: Decimal::ZERO,
            last_synced_at: None,
            rotated_at: None,
            created_at: Utc::now(),
        };
        self.add(wallet.clone());
        Ok(wallet)
    }

    async fn update_cached_balance(&self, id: Uuid, balance: Decimal) -> Result<()> {
        if let Some(w) = self.wallets.lock().unwrap().get_mut(&id) {
            w.available_balance = balance;
            w.last_synced_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn rotate(&self, old_id: Uuid, new_address: &str) -> Result<AgentWallet> {
        let mut wallets = self.wallets.lock().unwrap();
        let old = wallets
            .get_mut(&old_id)
            .filter(|w| w.rotated_at.is_none())
            .ok_or_else(|| Error::precondition(format!("agent wallet {old_id} already rotated")))?;
        old.rotated_at = Some(Utc::now());
        let (user_id, external_address) = (old.user_id, old.external_address.clone());

        let wallet = AgentWallet {
            id: Uuid::new_v4(),
            user_id,
            address: new_address.to_string(),
            external_address,
            available_balance: Decimal::ZERO,
            last_synced_at: None,
            rotated_at: None,
            created_at: Utc::now(),
        };
        wallets.insert(wallet.id, wallet.clone());
        Ok(wallet)
    }

    async fn list_active(&self) -> Result<Vec<AgentWallet>> {
        Ok(self
            .wallets
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.rotated_at.is_none())
            .cloned()
            .collect())
    }
}

/// In-memory [`BotStore`].
#[derive(Default)]
pub struct MemoryBotStore {
    bots: Mutex<HashMap<Uuid, TradingBot>>,
}

impl MemoryBotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bot: TradingBot) {
        self.bots.lock().unwrap().insert(bot.id, bot);
    }
}

#[async_trait]
impl BotStore for MemoryBotStore {
    async fn get(&self, id: Uuid) -> Result<Option<TradingBot>> {
        Ok(self.bots.lock().unwrap().get(&id).cloned())
    }

    async fn list_for_wallet(&self, agent_wallet_id: Uuid) -> Result<Vec<TradingBot>> {
        let mut bots: Vec<_> = self
            .bots
            .lock()
            .unwrap()
            .values()
            .filter(|b| b.agent_wallet_id == agent_wallet_id && b.deleted_at.is_none())
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        if let Some(b) = self.bots.lock().unwrap().get_mut(&id) {
            b.active = false;
            b.deleted_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn clear_subaccount(&self, id: Uuid) -> Result<()> {
        if let Some(b) = self.bots.lock().unwrap().get_mut(&id) {
            b.subaccount_index = None;
        }
        Ok(())
    }

    async fn update_cached_equity(&self, id: Uuid, equity: Decimal) -> Result<()> {
        if let Some(b) = self.bots.lock().unwrap().get_mut(&id) {
            b.cached_equity = equity;
            b.stats_synced_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// In-memory [`OperationStore`].
#[derive(Default)]
pub struct MemoryOperationStore {
    ops: Mutex<HashMap<Uuid, LifecycleOperation>>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn insert(&self, op: &LifecycleOperation) -> Result<()> {
        self.ops.lock().unwrap().insert(op.id, op.clone());
        Ok(())
    }

    async fn save(&self, op: &LifecycleOperation) -> Result<()> {
        self.ops.lock().unwrap().insert(op.id, op.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<LifecycleOperation>> {
        Ok(self.ops.lock().unwrap().get(&id).cloned())
    }

    async fn find_in_flight(
        &self,
        target: &OperationTarget,
    ) -> Result<Option<LifecycleOperation>> {
        Ok(self
            .ops
            .lock()
            .unwrap()
            .values()
            .filter(|op| {
                op.target == *target && !op.is_terminal() && op.abandoned_at.is_none()
            })
            .max_by_key(|op| op.created_at)
            .cloned())
    }

    async fn find_by_signature(&self, tx_signature: &str) -> Result<Option<LifecycleOperation>> {
        Ok(self
            .ops
            .lock()
            .unwrap()
            .values()
            .find(|op| op.tx_signature.as_deref() == Some(tx_signature))
            .cloned())
    }

    async fn claim_signature(&self, id: Uuid, tx_signature: &str) -> Result<bool> {
        let mut ops = self.ops.lock().unwrap();
        let taken_elsewhere = ops
            .values()
            .any(|op| op.id != id && op.tx_signature.as_deref() == Some(tx_signature));
        if taken_elsewhere {
            return Ok(false);
        }
        match ops.get_mut(&id) {
            Some(op) if op.tx_signature.is_none() || op.tx_signature.as_deref() == Some(tx_signature) => {
                op.tx_signature = Some(tx_signature.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_awaiting_signature(&self) -> Result<Vec<LifecycleOperation>> {
        let mut ops: Vec<_> = self
            .ops
            .lock()
            .unwrap()
            .values()
            .filter(|op| {
                op.state == crate::types::OperationState::AwaitingSignature
                    && op.abandoned_at.is_none()
            })
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.created_at);
        Ok(ops)
    }
}

// ---------------------------------------------------------------------------
// Venue fake
// ---------------------------------------------------------------------------

/// Shared balance state behind [`FakeVenue`].
#[derive(Default)]
pub struct VenueState {
    pub wallet_balances: HashMap<String, Decimal>,
    pub native_balances: HashMap<String, Decimal>,
    /// Subaccount balance plus the deposit reclaimed when it is closed.
    pub subaccounts: HashMap<(String, i16), (Decimal, Decimal)>,
    pub positions: HashMap<(String, i16), Vec<OpenPosition>>,
    pub tx_statuses: HashMap<String, TxStatus>,
    pub submitted: Vec<SignedTransaction>,
    /// Subaccount refs whose balance reads fail transiently.
    pub failing_reads: HashSet<(String, i16)>,
    /// Operation name -> error message injected on the next matching call.
    pub failures: HashMap<String, String>,
}

/// In-memory venue implementing every consumed seam over one shared state.
///
/// Sweeps, withdrawals and closures move balances like the real venue
/// would, so tests can assert conservation of funds.
#[derive(Default)]
pub struct FakeVenue {
    pub state: Mutex<VenueState>,
}

impl FakeVenue {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(subaccount: &SubaccountRef) -> (String, i16) {
        (subaccount.wallet_address.clone(), subaccount.index)
    }

    pub fn set_wallet_balance(&self, address: &str, balance: Decimal) {
        self.state
            .lock()
            .unwrap()
            .wallet_balances
            .insert(address.to_string(), balance);
    }

    pub fn set_native_balance(&self, address: &str, balance: Decimal) {
        self.state
            .lock()
            .unwrap()
            .native_balances
            .insert(address.to_string(), balance);
    }

    pub fn set_subaccount(&self, subaccount: &SubaccountRef, balance: Decimal, deposit: Decimal) {
        self.state
            .lock()
            .unwrap()
            .subaccounts
            .insert(Self::key(subaccount), (balance, deposit));
    }

    pub fn add_position(&self, subaccount: &SubaccountRef, position: OpenPosition) {
        self.state
            .lock()
            .unwrap()
            .positions
            .entry(Self::key(subaccount))
            .or_default()
            .push(position);
    }

    /// Make balance reads of one subaccount fail until cleared.
    pub fn fail_reads(&self, subaccount: &SubaccountRef) {
        self.state
            .lock()
            .unwrap()
            .failing_reads
            .insert(Self::key(subaccount));
    }

    pub fn clear_failing_reads(&self) {
        self.state.lock().unwrap().failing_reads.clear();
    }

    /// Inject a venue error for a named operation
    /// (`settle_pnl`, `sweep_to_main`, `close_subaccount`, `close_position`,
    /// `submit`, `build_intent`).
    pub fn set_failure(&self, operation: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(operation.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, operation: &str) {
        self.state.lock().unwrap().failures.remove(operation);
    }

    /// Override the reported status of a submitted transaction.
    pub fn set_tx_status(&self, tx_signature: &str, status: TxStatus) {
        self.state
            .lock()
            .unwrap()
            .tx_statuses
            .insert(tx_signature.to_string(), status);
    }

    pub fn wallet_balance_of(&self, address: &str) -> Decimal {
        self.state
            .lock()
            .unwrap()
            .wallet_balances
            .get(address)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn submitted_count(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }

    fn check_failure(state: &VenueState, operation: &str) -> Result<()> {
        if let Some(message) = state.failures.get(operation) {
            return Err(Error::Venue(VenueError::from_message(message.clone())));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerQuery for FakeVenue {
    async fn subaccount_balance(&self, subaccount: &SubaccountRef) -> Result<SubaccountBalance> {
        let state = self.state.lock().unwrap();
        if state.failing_reads.contains(&Self::key(subaccount)) {
            return Err(Error::Venue(VenueError::from_message(
                "ledger read timed out",
            )));
        }
        Ok(match state.subaccounts.get(&Self::key(subaccount)) {
            Some((balance, _)) => SubaccountBalance {
                balance: *balance,
                exists: true,
            },
            None => SubaccountBalance {
                balance: Decimal::ZERO,
                exists: false,
            },
        })
    }

    async fn wallet_balance(&self, address: &str) -> Result<Decimal> {
        let state = self.state.lock().unwrap();
        Self::check_failure(&state, "wallet_balance")?;
        Ok(state
            .wallet_balances
            .get(address)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn native_balance(&self, address: &str) -> Result<Decimal> {
        let state = self.state.lock().unwrap();
        Ok(state
            .native_balances
            .get(address)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn open_positions(&self, subaccount: &SubaccountRef) -> Result<Vec<OpenPosition>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .get(&Self::key(subaccount))
            .cloned()
            .unwrap_or_default())
    }

    async fn transaction_status(
        &self,
        tx_signature: &str,
        _confirmation_hints: &serde_json::Value,
    ) -> Result<TxStatus> {
        let state = self.state.lock().unwrap();
        if let Some(status) = state.tx_statuses.get(tx_signature) {
            return Ok(status.clone());
        }
        // Anything actually submitted confirms by default.
        if state.submitted.iter().any(|s| s.signature == tx_signature) {
            Ok(TxStatus::Confirmed)
        } else {
            Ok(TxStatus::Unknown)
        }
    }
}

#[async_trait]
impl IntentBuilder for FakeVenue {
    async fn build_intent(&self, kind: IntentKind) -> Result<UnsignedIntent> {
        let state = self.state.lock().unwrap();
        Self::check_failure(&state, "build_intent")?;
        // Deterministic for identical params, like the real build service.
        let encoded = serde_json::to_string(&kind)?;
        Ok(UnsignedIntent {
            unsigned_tx: encoded,
            confirmation_hints: serde_json::json!({ "intent": kind }),
        })
    }
}

#[async_trait]
impl VenueGateway for FakeVenue {
    async fn submit(&self, signed_tx: &SignedTransaction) -> Result<SubmitReceipt> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "submit")?;

        // Apply the balance movement the transaction encodes, so later
        // ledger reads see the effect of a confirmed submission.
        if let Ok(kind) = serde_json::from_str::<IntentKind>(&signed_tx.payload) {
            match kind {
                IntentKind::WithdrawSubaccount { subaccount } => {
                    let key = Self::key(&subaccount);
                    let moved = match state.subaccounts.get_mut(&key) {
                        Some((balance, _)) => {
                            let moved = *balance;
                            *balance = Decimal::ZERO;
                            moved
                        }
                        None => Decimal::ZERO,
                    };
                    *state
                        .wallet_balances
                        .entry(subaccount.wallet_address.clone())
                        .or_default() += moved;
                }
                IntentKind::WithdrawMain {
                    wallet_address,
                    amount,
                    ..
                } => {
                    if let Some(balance) = state.wallet_balances.get_mut(&wallet_address) {
                        *balance -= amount;
                    }
                }
                IntentKind::TransferNative { from, to, amount } => {
                    if let Some(balance) = state.native_balances.get_mut(&from) {
                        *balance -= amount;
                    }
                    *state.native_balances.entry(to).or_default() += amount;
                }
            }
        }

        state.submitted.push(signed_tx.clone());
        Ok(SubmitReceipt {
            tx_signature: signed_tx.signature.clone(),
        })
    }
}

#[async_trait]
impl VenueOps for FakeVenue {
    async fn close_position(&self, subaccount: &SubaccountRef, position_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "close_position")?;
        if let Some(positions) = state.positions.get_mut(&Self::key(subaccount)) {
            positions.retain(|p| p.position_id != position_id);
        }
        Ok(())
    }

    async fn settle_pnl(&self, subaccount: &SubaccountRef) -> Result<()> {
        let state = self.state.lock().unwrap();
        Self::check_failure(&state, "settle_pnl")?;
        let _ = subaccount;
        Ok(())
    }

    async fn sweep_to_main(&self, subaccount: &SubaccountRef) -> Result<Decimal> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "sweep_to_main")?;
        let key = Self::key(subaccount);
        let swept = match state.subaccounts.get_mut(&key) {
            Some((balance, _)) => {
                let moved = *balance;
                *balance = Decimal::ZERO;
                moved
            }
            None => Decimal::ZERO,
        };
        *state
            .wallet_balances
            .entry(subaccount.wallet_address.clone())
            .or_default() += swept;
        Ok(swept)
    }

    async fn close_subaccount(&self, subaccount: &SubaccountRef) -> Result<Decimal> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "close_subaccount")?;
        let key = Self::key(subaccount);
        let deposit = match state.subaccounts.get(&key).copied() {
            Some((balance, _)) if !balance.is_zero() => {
                return Err(Error::Venue(VenueError::from_message(format!(
                    "subaccount {subaccount} still holds {balance}"
                ))))
            }
            Some((_, deposit)) => {
                state.subaccounts.remove(&key);
                deposit
            }
            None => Decimal::ZERO,
        };
        *state
            .wallet_balances
            .entry(subaccount.wallet_address.clone())
            .or_default() += deposit;
        Ok(deposit)
    }

    async fn provision_wallet(&self, _user_id: Uuid) -> Result<String> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Ok(format!(
            "agent-{}",
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }
}

// ---------------------------------------------------------------------------
// Signer fake
// ---------------------------------------------------------------------------

/// How the fake signer answers signature requests.
pub enum SignerMode {
    /// Sign everything; the signature is derived from the payload so
    /// identical transactions produce identical signatures.
    Sign,
    /// Reject everything.
    Reject,
}

/// Scripted [`SignatureGateway`].
pub struct FakeSigner {
    mode: Mutex<SignerMode>,
}

impl FakeSigner {
    pub fn signing() -> Self {
        Self {
            mode: Mutex::new(SignerMode::Sign),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            mode: Mutex::new(SignerMode::Reject),
        }
    }

    pub fn set_mode(&self, mode: SignerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// The signature this signer would produce for a payload.
    pub fn signature_for(unsigned_tx: &str) -> String {
        // Cheap stable hash; the real signer returns an ed25519 signature.
        let digest: u64 = unsigned_tx
            .bytes()
            .fold(0xcbf29ce484222325, |acc: u64, b| {
                (acc ^ b as u64).wrapping_mul(0x100000001b3)
            });
        format!("sig-{digest:016x}")
    }
}

#[async_trait]
impl SignatureGateway for FakeSigner {
    async fn await_signature(
        &self,
        _operation_id: Uuid,
        unsigned_tx: &str,
    ) -> Result<SignatureOutcome> {
        match *self.mode.lock().unwrap() {
            SignerMode::Sign => Ok(SignatureOutcome::Signed(SignedTransaction {
                payload: unsigned_tx.to_string(),
                signature: Self::signature_for(unsigned_tx),
            })),
            SignerMode::Reject => Ok(SignatureOutcome::Rejected),
        }
    }
}
