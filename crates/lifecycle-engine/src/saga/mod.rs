//! The bot lifecycle saga.
//!
//! One coordinator drives three flows over the same plumbing: bot deletion
//! (`delete.rs`), account reset (`reset.rs`), and agent-wallet rotation
//! (`rotation.rs`). Flows are forward-only with per-step idempotence; the
//! persisted operation record is the source of truth across restarts.

mod delete;
mod reset;
mod rotation;

use crate::confirmation::Confirmer;
use crate::registry::OperationRegistry;
use chrono::{DateTime, Utc};
use custody_core::config::ConfirmationConfig;
use custody_core::db::{BotStore, OperationStore, WalletStore};
use custody_core::types::{
    LifecycleOperation, OperationKind, OperationResult, OperationState, SagaStep, StepOutcome,
};
use custody_core::venue::{
    IntentBuilder, LedgerQuery, SignatureGateway, SignatureOutcome, UnsignedIntent, VenueGateway,
    VenueOps,
};
use custody_core::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Capacity of the step event broadcast channel.
const STEP_CHANNEL_CAPACITY: usize = 256;

/// Progress event published while a saga runs.
#[derive(Debug, Clone, Serialize)]
pub struct StepEvent {
    pub operation_id: Uuid,
    pub step: Option<SagaStep>,
    #[serde(flatten)]
    pub status: StepEventStatus,
    pub timestamp: DateTime<Utc>,
}

/// Status carried by a [`StepEvent`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepEventStatus {
    Started,
    Ok,
    Skipped { reason: String },
    Failed { reason: String },
    AwaitingSignature,
    Confirming,
    Terminal { result: OperationResult },
}

/// Collaborators the saga drives.
pub struct SagaDeps {
    pub bots: Arc<dyn BotStore>,
    pub wallets: Arc<dyn WalletStore>,
    pub operations: Arc<dyn OperationStore>,
    pub ledger: Arc<dyn LedgerQuery>,
    pub intents: Arc<dyn IntentBuilder>,
    pub gateway: Arc<dyn VenueGateway>,
    pub venue_ops: Arc<dyn VenueOps>,
    pub signer: Arc<dyn SignatureGateway>,
}

/// The lifecycle saga coordinator.
pub struct LifecycleSaga {
    deps: SagaDeps,
    registry: Arc<OperationRegistry>,
    confirmer: Confirmer,
    step_tx: broadcast::Sender<StepEvent>,
    /// Agent wallet ids pushed here get re-reconciled after a lifecycle
    /// operation finishes.
    reconcile_tx: Option<mpsc::Sender<Uuid>>,
}

impl LifecycleSaga {
    pub fn new(deps: SagaDeps, confirmation: ConfirmationConfig) -> Self {
        let (step_tx, _) = broadcast::channel(STEP_CHANNEL_CAPACITY);
        let confirmer = Confirmer::new(deps.ledger.clone(), confirmation);
        Self {
            deps,
            registry: Arc::new(OperationRegistry::new()),
            confirmer,
            step_tx,
            reconcile_tx: None,
        }
    }

    /// Wire the on-demand reconciliation trigger.
    pub fn with_reconcile_trigger(mut self, tx: mpsc::Sender<Uuid>) -> Self {
        self.reconcile_tx = Some(tx);
        self
    }

    /// Subscribe to saga progress events.
    pub fn subscribe_steps(&self) -> broadcast::Receiver<StepEvent> {
        self.step_tx.subscribe()
    }

    /// The in-process single-flight registry (shared with the equity
    /// aggregator so it can annotate saga targets as stale).
    pub fn registry(&self) -> Arc<OperationRegistry> {
        self.registry.clone()
    }

    /// Fetch an operation record.
    pub async fn get_operation(&self, operation_id: Uuid) -> Result<LifecycleOperation> {
        self.deps
            .operations
            .get(operation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {operation_id}")))
    }

    /// Operations parked on a signature, e.g. after a process restart.
    pub async fn awaiting_signature(&self) -> Result<Vec<LifecycleOperation>> {
        self.deps.operations.list_awaiting_signature().await
    }

    /// Reject the signature request of an operation parked on the signer.
    ///
    /// Cancels only the current step; effects of already-confirmed prior
    /// steps stand, and the terminal result reflects them.
    pub async fn reject_signature(&self, operation_id: Uuid) -> Result<LifecycleOperation> {
        let mut op = self.get_operation(operation_id).await?;
        if op.state != OperationState::AwaitingSignature {
            return Err(Error::precondition(format!(
                "operation {operation_id} is not awaiting a signature"
            )));
        }

        let step = op.current_step.unwrap_or(SagaStep::Sweep);
        op.record_step(
            step,
            StepOutcome::Failed {
                reason: "signature rejected by user".to_string(),
            },
        );
        let result = match op.kind {
            OperationKind::ResetAccount => terminal_result_after_failure(&op),
            _ => OperationResult::Failed,
        };
        self.finish(&mut op, result, None).await?;
        Ok(op)
    }

    /// Explicitly abandon a non-terminal operation the user walked away
    /// from. Prior confirmed steps stand.
    pub async fn abandon_operation(&self, operation_id: Uuid) -> Result<LifecycleOperation> {
        let mut op = self.get_operation(operation_id).await?;
        if op.is_terminal() {
            return Err(Error::precondition(format!(
                "operation {operation_id} already reached a terminal state"
            )));
        }

        if let Some(step) = op.current_step {
            op.record_step(step, StepOutcome::Abandoned);
        }
        op.abandoned_at = Some(Utc::now());
        warn!(operation_id = %operation_id, "Lifecycle operation abandoned by user");
        let result = terminal_result_after_failure(&op);
        self.finish(&mut op, result, None).await?;
        Ok(op)
    }

    // ── shared plumbing ────────────────────────────────────────────────

    pub(crate) fn publish(&self, operation_id: Uuid, step: Option<SagaStep>, status: StepEventStatus) {
        let _ = self.step_tx.send(StepEvent {
            operation_id,
            step,
            status,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn publish_outcome(&self, operation_id: Uuid, step: SagaStep, outcome: &StepOutcome) {
        let status = match outcome {
            StepOutcome::Ok => StepEventStatus::Ok,
            StepOutcome::Failed { reason } => StepEventStatus::Failed {
                reason: reason.clone(),
            },
            StepOutcome::Pending { tx_signature } => StepEventStatus::Failed {
                reason: format!("confirmation pending for {tx_signature}; check ledger"),
            },
            StepOutcome::Skipped { reason } => StepEventStatus::Skipped {
                reason: reason.clone(),
            },
            StepOutcome::Abandoned => StepEventStatus::Failed {
                reason: "abandoned".to_string(),
            },
        };
        self.publish(operation_id, Some(step), status);
    }

    /// Drive an operation to its terminal state: persist, release the
    /// target, publish, and poke the reconciler.
    pub(crate) async fn finish(
        &self,
        op: &mut LifecycleOperation,
        result: OperationResult,
        reconcile_wallet: Option<Uuid>,
    ) -> Result<()> {
        op.state = OperationState::Terminal;
        op.result = Some(result);
        self.deps.operations.save(op).await?;
        self.registry.release(&op.target, op.id);
        self.publish(op.id, None, StepEventStatus::Terminal { result });

        if let (Some(wallet_id), Some(tx)) = (reconcile_wallet, &self.reconcile_tx) {
            let _ = tx.try_send(wallet_id);
        }

        info!(
            operation_id = %op.id,
            kind = op.kind.as_str(),
            result = result.as_str(),
            "Lifecycle operation finished"
        );
        Ok(())
    }

    /// Mark an operation failed after an unexpected engine error (storage
    /// outage mid-run). Best effort; the record stays resumable via the
    /// step log.
    pub(crate) async fn fail_operation(&self, operation_id: Uuid, reason: &str) {
        match self.deps.operations.get(operation_id).await {
            Ok(Some(mut op)) if !op.is_terminal() => {
                if let Some(step) = op.current_step {
                    op.record_step(
                        step,
                        StepOutcome::Failed {
                            reason: reason.to_string(),
                        },
                    );
                }
                let result = terminal_result_after_failure(&op);
                if let Err(e) = self.finish(&mut op, result, None).await {
                    error!(operation_id = %operation_id, error = %e, "Failed to persist terminal state");
                    self.registry.release(&op.target, op.id);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(operation_id = %operation_id, error = %e, "Failed to load operation after engine error");
            }
        }
    }

    /// Run one signed-transaction leg: park on the external signer, submit,
    /// and confirm with bounded backoff. Shared by the reset flow's
    /// withdrawing step and the rotation transfer.
    pub(crate) async fn sign_submit_confirm(
        &self,
        op: &mut LifecycleOperation,
        step: SagaStep,
        intent: UnsignedIntent,
    ) -> StepOutcome {
        op.unsigned_tx = Some(intent.unsigned_tx.clone());
        op.confirmation_hints = Some(intent.confirmation_hints.clone());
        op.state = OperationState::AwaitingSignature;
        if let Err(e) = self.deps.operations.save(op).await {
            return StepOutcome::Failed {
                reason: format!("failed to persist operation: {e}"),
            };
        }
        self.publish(op.id, Some(step), StepEventStatus::AwaitingSignature);

        // User-paced wait; no timeout.
        let signed = match self.deps.signer.await_signature(op.id, &intent.unsigned_tx).await {
            Ok(SignatureOutcome::Signed(signed)) => signed,
            Ok(SignatureOutcome::Rejected) => {
                return StepOutcome::Failed {
                    reason: "signature rejected by user".to_string(),
                }
            }
            Err(e) => {
                return StepOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let receipt = match self.deps.gateway.submit(&signed).await {
            Ok(receipt) => receipt,
            Err(e) => {
                return StepOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        match self
            .deps
            .operations
            .claim_signature(op.id, &receipt.tx_signature)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return StepOutcome::Failed {
                    reason: format!(
                        "transaction {} already claimed by another operation",
                        receipt.tx_signature
                    ),
                }
            }
            Err(e) => {
                // Submission went through but the claim did not persist;
                // surface the ambiguity instead of guessing.
                warn!(
                    operation_id = %op.id,
                    tx_signature = %receipt.tx_signature,
                    error = %e,
                    "Signature claim failed after submission"
                );
                return StepOutcome::Pending {
                    tx_signature: receipt.tx_signature,
                };
            }
        }
        op.tx_signature = Some(receipt.tx_signature.clone());
        op.state = OperationState::Confirming;
        if let Err(e) = self.deps.operations.save(op).await {
            warn!(operation_id = %op.id, error = %e, "Failed to persist confirming state");
        }
        self.publish(op.id, Some(step), StepEventStatus::Confirming);

        self.confirm_outcome(&receipt.tx_signature, &intent.confirmation_hints)
            .await
    }

    /// Re-check a previously submitted transaction without resubmitting.
    pub(crate) async fn confirm_outcome(
        &self,
        tx_signature: &str,
        confirmation_hints: &serde_json::Value,
    ) -> StepOutcome {
        match self.confirmer.confirm(tx_signature, confirmation_hints).await {
            crate::confirmation::ConfirmOutcome::Confirmed => StepOutcome::Ok,
            crate::confirmation::ConfirmOutcome::StillPending => StepOutcome::Pending {
                tx_signature: tx_signature.to_string(),
            },
            crate::confirmation::ConfirmOutcome::Failed { reason } => {
                StepOutcome::Failed { reason }
            }
        }
    }

    /// Reject a second operation when the target already has one in
    /// flight, in storage or in this process.
    pub(crate) async fn ensure_single_flight(
        &self,
        target: &custody_core::types::OperationTarget,
    ) -> Result<()> {
        if let Some(existing) = self.deps.operations.find_in_flight(target).await? {
            return Err(Error::OperationInFlight {
                operation_id: existing.id,
            });
        }
        if let Some(holder) = self.registry.holder(target) {
            return Err(Error::OperationInFlight {
                operation_id: holder,
            });
        }
        Ok(())
    }

    /// A wallet-level saga and a bot-level saga under the same wallet
    /// would mutate the same subaccounts; admission rejects either while
    /// the other is in flight.
    pub(crate) async fn ensure_wallet_family_free(&self, agent_wallet_id: Uuid) -> Result<()> {
        self.ensure_single_flight(&custody_core::types::OperationTarget::AgentWallet(
            agent_wallet_id,
        ))
        .await?;
        for bot in self.deps.bots.list_for_wallet(agent_wallet_id).await? {
            self.ensure_single_flight(&custody_core::types::OperationTarget::Bot(bot.id))
                .await?;
        }
        Ok(())
    }
}

/// Partial success when anything settled before the failure; plain failure
/// otherwise.
pub(crate) fn terminal_result_after_failure(op: &LifecycleOperation) -> OperationResult {
    if op.steps.iter().any(|r| r.outcome.is_settled()) {
        OperationResult::PartialSuccess
    } else {
        OperationResult::Failed
    }
}

/// Human-readable reason extracted from the most recent failed step.
pub(crate) fn failure_reason(op: &LifecycleOperation) -> String {
    op.steps
        .iter()
        .rev()
        .find_map(|r| match &r.outcome {
            StepOutcome::Failed { reason } => Some(reason.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "operation failed".to_string())
}
