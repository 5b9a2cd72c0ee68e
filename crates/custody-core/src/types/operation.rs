//! Lifecycle operation types — the persisted saga instance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of destructive workflow the operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Delete one trading bot (sweeping its subaccount first if funded).
    Delete,
    /// Tear down all positions and subaccounts under an agent wallet.
    ResetAccount,
    /// Full reset plus rotation to a fresh agent wallet identity.
    ResetAgentWallet,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::ResetAccount => "reset_account",
            Self::ResetAgentWallet => "reset_agent_wallet",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "delete" => Some(Self::Delete),
            "reset_account" => Some(Self::ResetAccount),
            "reset_agent_wallet" => Some(Self::ResetAgentWallet),
            _ => None,
        }
    }
}

/// The saga's target: one bot or one agent wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OperationTarget {
    Bot(Uuid),
    AgentWallet(Uuid),
}

impl OperationTarget {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Bot(id) | Self::AgentWallet(id) => *id,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Bot(_) => "bot",
            Self::AgentWallet(_) => "agent_wallet",
        }
    }
}

/// Coarse saga state, persisted so an operation survives process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Steps are executing.
    Running,
    /// Parked on the external signer; user-paced, no timeout.
    AwaitingSignature,
    /// Transaction submitted, polling the ledger for confirmation.
    Confirming,
    /// Reached a terminal result.
    Terminal,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingSignature => "awaiting_signature",
            Self::Confirming => "confirming",
            Self::Terminal => "terminal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "awaiting_signature" => Some(Self::AwaitingSignature),
            "confirming" => Some(Self::Confirming),
            "terminal" => Some(Self::Terminal),
            _ => None,
        }
    }
}

/// Terminal outcome of a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Success,
    /// Some steps completed and at least one did not. The step log says which.
    PartialSuccess,
    Failed,
}

impl OperationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial_success" => Some(Self::PartialSuccess),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One step of a lifecycle saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    // Delete flow
    /// Withdraw the subaccount balance before the bot record can go.
    Sweep,
    /// Idempotent finalize: soft-delete the bot, record the tx reference.
    Finalize,
    // Reset flow
    /// Close every open position across every subaccount.
    Closing,
    /// Realize unrealized P&L into the settlement asset.
    Settling,
    /// Move subaccount balances into the agent wallet's main balance.
    Sweeping,
    /// Move the main balance out per the operation's policy.
    Withdrawing,
    /// Remove empty subaccount ledger entries, reclaim existence deposits.
    Deleting,
    // Wallet rotation
    /// Transfer residual native balance from the old wallet.
    Transfer,
    /// Swap in the new agent wallet identity.
    Rotate,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sweep => "sweep",
            Self::Finalize => "finalize",
            Self::Closing => "closing",
            Self::Settling => "settling",
            Self::Sweeping => "sweeping",
            Self::Withdrawing => "withdrawing",
            Self::Deleting => "deleting",
            Self::Transfer => "transfer",
            Self::Rotate => "rotate",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sweep" => Some(Self::Sweep),
            "finalize" => Some(Self::Finalize),
            "closing" => Some(Self::Closing),
            "settling" => Some(Self::Settling),
            "sweeping" => Some(Self::Sweeping),
            "withdrawing" => Some(Self::Withdrawing),
            "deleting" => Some(Self::Deleting),
            "transfer" => Some(Self::Transfer),
            "rotate" => Some(Self::Rotate),
            _ => None,
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step, recorded in the operation's durable step log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Failed { reason: String },
    /// Submitted but confirmation could not be established. Never coerced
    /// to ok or failed; resume re-checks the ledger by signature.
    Pending { tx_signature: String },
    Skipped { reason: String },
    /// The user explicitly walked away from this step.
    Abandoned,
}

impl StepOutcome {
    /// Whether a resumed run may skip past this step.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ok | Self::Skipped { .. })
    }
}

/// One entry of the ordered step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: SagaStep,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(step: SagaStep, outcome: StepOutcome) -> Self {
        Self {
            step,
            outcome,
            recorded_at: Utc::now(),
        }
    }
}

/// The persisted saga instance.
///
/// One row per in-flight destructive workflow; survives restarts so an
/// abandoned signing step can be resumed or explicitly abandoned later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleOperation {
    pub id: Uuid,
    pub target: OperationTarget,
    pub kind: OperationKind,
    pub state: OperationState,
    pub current_step: Option<SagaStep>,
    /// Ordered log of attempted steps and their individual outcomes.
    pub steps: Vec<StepRecord>,
    pub result: Option<OperationResult>,
    /// Unsigned transaction waiting on the external signer, if any.
    pub unsigned_tx: Option<String>,
    /// Opaque hints from the transaction build service used to confirm.
    pub confirmation_hints: Option<serde_json::Value>,
    /// Signature of the submitted transaction; dedupe key for finalize.
    pub tx_signature: Option<String>,
    /// Withdrawal policy for reset operations.
    pub scope: Option<ResetScope>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleOperation {
    pub fn new(target: OperationTarget, kind: OperationKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target,
            kind,
            state: OperationState::Running,
            current_step: None,
            steps: Vec::new(),
            result: None,
            unsigned_tx: None,
            confirmation_hints: None,
            tx_signature: None,
            scope: None,
            abandoned_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == OperationState::Terminal
    }

    /// Record a step outcome in the ordered log.
    pub fn record_step(&mut self, step: SagaStep, outcome: StepOutcome) {
        self.steps.push(StepRecord::new(step, outcome));
    }

    /// Outcome recorded for a given step, if any.
    pub fn step_outcome(&self, step: SagaStep) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .rev()
            .find(|r| r.step == step)
            .map(|r| &r.outcome)
    }
}

/// Outcome of a delete request.
///
/// An explicit tagged union: the "legacy bot" / "requiresSweep" flags
/// of older endpoint designs are variants here, not parallel booleans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// No funds were associated; the record is gone.
    Deleted,
    /// Funds sit in an address the coordinator cannot sweep. Deletion
    /// requires an explicit "delete anyway" acknowledgment.
    LegacyWarning { address: String, balance: Decimal },
    /// The subaccount holds funds; they must be swept out first. The
    /// unsigned withdrawal transaction awaits the external signer.
    SweepRequired {
        balance: Decimal,
        operation_id: Uuid,
        unsigned_tx: String,
    },
}

/// Parameters for the delete finalize call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmDelete {
    /// The signed withdrawal transaction, when finalizing a sweep.
    pub signed_tx: Option<SignedTransaction>,
    /// Signature of a previously submitted transaction, for idempotent
    /// retries after a timeout whose submission actually went through.
    pub tx_signature: Option<String>,
    /// Explicit "delete anyway" acknowledgment for legacy bots.
    #[serde(default)]
    pub acknowledge_legacy: bool,
}

/// Outcome of the delete finalize call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmDeleteOutcome {
    Deleted,
    /// Submitted, confirmation not yet established. Check the ledger or
    /// retry with the same signature.
    StillPending { tx_signature: String },
    Failed { reason: String },
}

/// A transaction signed by the external signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Serialized signed transaction, ready for submission.
    pub payload: String,
    /// The transaction signature; doubles as the finalize dedupe key.
    pub signature: String,
}

/// Policy for the reset-account flow's withdrawing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    /// Funds stay in the agent wallet's main balance.
    AccountOnly,
    /// Main balance is withdrawn to the user's external wallet.
    Full,
}

impl ResetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountOnly => "account_only",
            Self::Full => "full",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "account_only" => Some(Self::AccountOnly),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}
