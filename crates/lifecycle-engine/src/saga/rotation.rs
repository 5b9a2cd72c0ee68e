//! Agent-wallet rotation.
//!
//! A degenerate reset: preconditions demand zero open positions and zero
//! subaccount balances, and the residual-transfer leg must confirm before
//! the identity swap happens. Rotating first would orphan funds, so any
//! failure or ambiguity aborts without rotating.

use super::{LifecycleSaga, StepEventStatus};
use custody_core::db::{BotStore, OperationStore, WalletStore};
use custody_core::types::{
    AgentWallet, LifecycleOperation, OperationKind, OperationResult, OperationState,
    OperationTarget, SagaStep, StepOutcome,
};
use custody_core::venue::{IntentBuilder, IntentKind, LedgerQuery, VenueOps};
use custody_core::{Error, Result};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

impl LifecycleSaga {
    /// Rotate an agent wallet to a fresh custodial identity.
    ///
    /// Preconditions are checked, not assumed: every subaccount must be
    /// empty with no open positions. Violations reject before any state
    /// transition.
    pub async fn request_wallet_rotation(self: Arc<Self>, agent_wallet_id: Uuid) -> Result<Uuid> {
        let wallet = self.deps.wallets.get_active(agent_wallet_id).await?;
        let target = OperationTarget::AgentWallet(agent_wallet_id);
        self.ensure_wallet_family_free(agent_wallet_id).await?;

        let bots = self.deps.bots.list_for_wallet(agent_wallet_id).await?;
        for bot in &bots {
            let Some(subaccount) = bot.subaccount(&wallet.address) else {
                continue;
            };
            let balance = self.deps.ledger.subaccount_balance(&subaccount).await?;
            if balance.exists && !balance.balance.is_zero() {
                return Err(Error::precondition(format!(
                    "subaccount {subaccount} still holds {}; reset the account first",
                    balance.balance
                )));
            }
            let positions = self.deps.ledger.open_positions(&subaccount).await?;
            if !positions.is_empty() {
                return Err(Error::precondition(format!(
                    "subaccount {subaccount} has {} open positions",
                    positions.len()
                )));
            }
        }

        let mut op = LifecycleOperation::new(target, OperationKind::ResetAgentWallet);
        self.registry.acquire(target, op.id)?;
        if let Err(e) = self.deps.operations.insert(&op).await {
            self.registry.release(&target, op.id);
            return Err(e);
        }

        info!(
            agent_wallet_id = %agent_wallet_id,
            operation_id = %op.id,
            "Starting agent wallet rotation"
        );

        let op_id = op.id;
        let saga = self;
        tokio::spawn(async move {
            if let Err(e) = saga.run_rotation(op_id).await {
                error!(operation_id = %op_id, error = %e, "Rotation saga aborted");
                saga.fail_operation(op_id, &e.to_string()).await;
            }
        });
        Ok(op_id)
    }

    async fn run_rotation(&self, operation_id: Uuid) -> Result<()> {
        let mut op = self.get_operation(operation_id).await?;
        let wallet_id = op.target.id();
        let wallet = self.deps.wallets.get_active(wallet_id).await?;

        // Transfer leg: move any residual native balance off the old
        // wallet. Must confirm before the identity swap.
        op.current_step = Some(SagaStep::Transfer);
        self.deps.operations.save(&op).await?;
        self.publish(op.id, Some(SagaStep::Transfer), StepEventStatus::Started);

        let outcome = self.transfer_residual(&wallet, &mut op).await;
        op.record_step(SagaStep::Transfer, outcome.clone());
        self.deps.operations.save(&op).await?;
        self.publish_outcome(op.id, SagaStep::Transfer, &outcome);

        match outcome {
            StepOutcome::Ok | StepOutcome::Skipped { .. } => {}
            // Failed or ambiguous: abort without rotating. The old wallet
            // stays live; a later attempt re-reads the residual balance.
            _ => {
                self.finish(&mut op, OperationResult::Failed, None).await?;
                return Ok(());
            }
        }

        // Identity swap, only after the transfer settled.
        op.current_step = Some(SagaStep::Rotate);
        op.state = OperationState::Running;
        self.deps.operations.save(&op).await?;
        self.publish(op.id, Some(SagaStep::Rotate), StepEventStatus::Started);

        let new_address = match self.deps.venue_ops.provision_wallet(wallet.user_id).await {
            Ok(address) => address,
            Err(e) => {
                op.record_step(
                    SagaStep::Rotate,
                    StepOutcome::Failed {
                        reason: e.to_string(),
                    },
                );
                self.finish(&mut op, OperationResult::Failed, None).await?;
                return Ok(());
            }
        };

        match self.deps.wallets.rotate(wallet_id, &new_address).await {
            Ok(new_wallet) => {
                op.record_step(SagaStep::Rotate, StepOutcome::Ok);
                self.publish(op.id, Some(SagaStep::Rotate), StepEventStatus::Ok);
                self.finish(&mut op, OperationResult::Success, Some(new_wallet.id))
                    .await?;
                info!(
                    old_wallet = %wallet.address,
                    new_wallet = %new_wallet.address,
                    "Agent wallet rotated"
                );
            }
            Err(e) => {
                op.record_step(
                    SagaStep::Rotate,
                    StepOutcome::Failed {
                        reason: e.to_string(),
                    },
                );
                self.finish(&mut op, OperationResult::Failed, None).await?;
            }
        }
        Ok(())
    }

    async fn transfer_residual(
        &self,
        wallet: &AgentWallet,
        op: &mut LifecycleOperation,
    ) -> StepOutcome {
        let residual = match self.deps.ledger.native_balance(&wallet.address).await {
            Ok(residual) => residual,
            Err(e) => {
                return StepOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        if residual.is_zero() {
            return StepOutcome::Skipped {
                reason: "no residual native balance".to_string(),
            };
        }

        let intent = match self
            .deps
            .intents
            .build_intent(IntentKind::TransferNative {
                from: wallet.address.clone(),
                to: wallet.external_address.clone(),
                amount: residual,
            })
            .await
        {
            Ok(intent) => intent,
            Err(e) => {
                return StepOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.sign_submit_confirm(op, SagaStep::Transfer, intent).await
    }
}
