//! Account reset flow.
//!
//! closing → settling → sweeping → withdrawing → deleting, forward-only.
//! A step failure stops the run and terminates with `partial_success`
//! carrying the ordered step log; resume re-enters at the first step that
//! never settled. Nothing is ever rolled back — there is no compensating
//! transaction for un-closing a position.

use super::{terminal_result_after_failure, LifecycleSaga, StepEventStatus};
use custody_core::db::{BotStore, OperationStore, WalletStore};
use custody_core::types::{
    AgentWallet, LifecycleOperation, OperationKind, OperationResult, OperationState,
    OperationTarget, ResetScope, SagaStep, StepOutcome, SubaccountRef,
};
use custody_core::venue::{IntentBuilder, IntentKind, LedgerQuery, VenueOps};
use custody_core::{Error, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Step order of the reset flow.
const RESET_STEPS: [SagaStep; 5] = [
    SagaStep::Closing,
    SagaStep::Settling,
    SagaStep::Sweeping,
    SagaStep::Withdrawing,
    SagaStep::Deleting,
];

impl LifecycleSaga {
    /// Start a reset of every subaccount under an agent wallet. Returns
    /// the operation id; progress streams via [`subscribe_steps`].
    ///
    /// [`subscribe_steps`]: LifecycleSaga::subscribe_steps
    pub async fn request_reset(
        self: Arc<Self>,
        agent_wallet_id: Uuid,
        scope: ResetScope,
    ) -> Result<Uuid> {
        self.deps.wallets.get_active(agent_wallet_id).await?;
        let target = OperationTarget::AgentWallet(agent_wallet_id);
        self.ensure_wallet_family_free(agent_wallet_id).await?;

        let mut op = LifecycleOperation::new(target, OperationKind::ResetAccount);
        op.scope = Some(scope);
        self.registry.acquire(target, op.id)?;
        if let Err(e) = self.deps.operations.insert(&op).await {
            self.registry.release(&target, op.id);
            return Err(e);
        }

        info!(
            agent_wallet_id = %agent_wallet_id,
            operation_id = %op.id,
            scope = scope.as_str(),
            "Starting account reset"
        );
        let op_id = op.id;
        Self::spawn_reset(self, op_id);
        Ok(op_id)
    }

    /// Resume a reset that stopped partway (failed suffix, pending
    /// confirmation, or a restart mid-signature). Settled steps are
    /// skipped; the failed suffix runs again.
    pub async fn resume_reset(self: Arc<Self>, operation_id: Uuid) -> Result<()> {
        let mut op = self.get_operation(operation_id).await?;
        if op.kind != OperationKind::ResetAccount {
            return Err(Error::precondition(format!(
                "operation {operation_id} is not an account reset"
            )));
        }
        if op.abandoned_at.is_some() {
            return Err(Error::precondition(format!(
                "operation {operation_id} was abandoned"
            )));
        }
        if op.is_terminal() && op.result == Some(OperationResult::Success) {
            return Err(Error::precondition(format!(
                "operation {operation_id} already completed"
            )));
        }

        self.registry.acquire(op.target, op.id)?;
        op.state = OperationState::Running;
        op.result = None;
        if let Err(e) = self.deps.operations.save(&op).await {
            self.registry.release(&op.target, op.id);
            return Err(e);
        }

        info!(operation_id = %operation_id, "Resuming account reset");
        Self::spawn_reset(self, operation_id);
        Ok(())
    }

    fn spawn_reset(saga: Arc<Self>, operation_id: Uuid) {
        tokio::spawn(async move {
            if let Err(e) = saga.run_reset(operation_id).await {
                error!(operation_id = %operation_id, error = %e, "Reset saga aborted");
                saga.fail_operation(operation_id, &e.to_string()).await;
            }
        });
    }

    async fn run_reset(&self, operation_id: Uuid) -> Result<()> {
        let mut op = self.get_operation(operation_id).await?;
        let wallet_id = op.target.id();
        let wallet = self.deps.wallets.get_active(wallet_id).await?;
        let scope = op.scope.unwrap_or(ResetScope::Full);

        let bots = self.deps.bots.list_for_wallet(wallet_id).await?;
        let subaccounts: Vec<(Uuid, SubaccountRef)> = bots
            .iter()
            .filter_map(|bot| bot.subaccount(&wallet.address).map(|sub| (bot.id, sub)))
            .collect();

        for step in RESET_STEPS {
            if op.step_outcome(step).is_some_and(|o| o.is_settled()) {
                continue;
            }

            op.current_step = Some(step);
            op.state = OperationState::Running;
            self.deps.operations.save(&op).await?;
            self.publish(op.id, Some(step), StepEventStatus::Started);

            let outcome = self
                .execute_reset_step(step, &wallet, &subaccounts, scope, &mut op)
                .await;
            op.record_step(step, outcome.clone());
            self.deps.operations.save(&op).await?;
            self.publish_outcome(op.id, step, &outcome);

            match outcome {
                StepOutcome::Ok | StepOutcome::Skipped { .. } => {}
                StepOutcome::Failed { ref reason } => {
                    warn!(
                        operation_id = %op.id,
                        step = %step,
                        reason = %reason,
                        "Reset step failed; prior steps stand"
                    );
                    let result = terminal_result_after_failure(&op);
                    self.finish(&mut op, result, Some(wallet_id)).await?;
                    return Ok(());
                }
                StepOutcome::Pending { ref tx_signature } => {
                    warn!(
                        operation_id = %op.id,
                        step = %step,
                        tx_signature = %tx_signature,
                        "Reset step submitted but unconfirmed; check ledger before retrying"
                    );
                    self.finish(&mut op, OperationResult::PartialSuccess, Some(wallet_id))
                        .await?;
                    return Ok(());
                }
                StepOutcome::Abandoned => return Ok(()),
            }
        }

        self.finish(&mut op, OperationResult::Success, Some(wallet_id))
            .await?;

        // Refresh the cached available balance now that funds moved.
        match self.deps.ledger.wallet_balance(&wallet.address).await {
            Ok(balance) => {
                self.deps
                    .wallets
                    .update_cached_balance(wallet_id, balance)
                    .await?;
            }
            Err(e) => {
                warn!(agent_wallet_id = %wallet_id, error = %e, "Post-reset balance sync failed");
            }
        }
        Ok(())
    }

    async fn execute_reset_step(
        &self,
        step: SagaStep,
        wallet: &AgentWallet,
        subaccounts: &[(Uuid, SubaccountRef)],
        scope: ResetScope,
        op: &mut LifecycleOperation,
    ) -> StepOutcome {
        match step {
            SagaStep::Closing => self.close_all_positions(subaccounts).await,
            SagaStep::Settling => self.settle_all(subaccounts).await,
            SagaStep::Sweeping => self.sweep_all(subaccounts).await,
            SagaStep::Withdrawing => self.withdraw_main(wallet, scope, op).await,
            SagaStep::Deleting => self.delete_subaccounts(subaccounts).await,
            _ => unreachable!("not a reset step"),
        }
    }

    /// Close every open position across every subaccount. Failures on one
    /// position do not stop the others; the step settles only when all
    /// of them closed.
    async fn close_all_positions(&self, subaccounts: &[(Uuid, SubaccountRef)]) -> StepOutcome {
        let mut failed = 0usize;
        let mut total = 0usize;
        let mut first_error: Option<String> = None;

        for (_, subaccount) in subaccounts {
            let positions = match self.deps.ledger.open_positions(subaccount).await {
                Ok(positions) => positions,
                Err(e) => {
                    failed += 1;
                    total += 1;
                    first_error.get_or_insert_with(|| e.to_string());
                    continue;
                }
            };
            for position in positions {
                total += 1;
                if let Err(e) = self
                    .deps
                    .venue_ops
                    .close_position(subaccount, &position.position_id)
                    .await
                {
                    warn!(
                        subaccount = %subaccount,
                        position_id = %position.position_id,
                        error = %e,
                        "Failed to close position"
                    );
                    failed += 1;
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if failed > 0 {
            StepOutcome::Failed {
                reason: format!(
                    "{failed} of {total} positions failed to close: {}",
                    first_error.unwrap_or_default()
                ),
            }
        } else {
            StepOutcome::Ok
        }
    }

    async fn settle_all(&self, subaccounts: &[(Uuid, SubaccountRef)]) -> StepOutcome {
        for (_, subaccount) in subaccounts {
            if let Err(e) = self.deps.venue_ops.settle_pnl(subaccount).await {
                return StepOutcome::Failed {
                    reason: format!("settlement failed for {subaccount}: {e}"),
                };
            }
        }
        StepOutcome::Ok
    }

    async fn sweep_all(&self, subaccounts: &[(Uuid, SubaccountRef)]) -> StepOutcome {
        let mut swept_total = Decimal::ZERO;
        for (_, subaccount) in subaccounts {
            match self.deps.venue_ops.sweep_to_main(subaccount).await {
                Ok(amount) => swept_total += amount,
                Err(e) => {
                    // Whatever already swept stays in the main balance.
                    return StepOutcome::Failed {
                        reason: format!("sweep failed for {subaccount}: {e}"),
                    };
                }
            }
        }
        info!(swept_total = %swept_total, "Swept subaccount balances into main");
        StepOutcome::Ok
    }

    /// Withdraw the main balance per the reset policy. Runs the full
    /// build → sign → submit → confirm leg; a resumed pending submission
    /// is re-checked against the ledger, never resubmitted.
    async fn withdraw_main(
        &self,
        wallet: &AgentWallet,
        scope: ResetScope,
        op: &mut LifecycleOperation,
    ) -> StepOutcome {
        if scope == ResetScope::AccountOnly {
            return StepOutcome::Skipped {
                reason: "account-only reset leaves funds in the agent wallet".to_string(),
            };
        }

        if let Some(StepOutcome::Pending { tx_signature }) =
            op.step_outcome(SagaStep::Withdrawing).cloned()
        {
            let hints = op
                .confirmation_hints
                .clone()
                .unwrap_or_else(|| serde_json::json!({}));
            return self.confirm_outcome(&tx_signature, &hints).await;
        }

        let amount = match self.deps.ledger.wallet_balance(&wallet.address).await {
            Ok(amount) => amount,
            Err(e) => {
                return StepOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        if amount.is_zero() {
            return StepOutcome::Skipped {
                reason: "nothing to withdraw".to_string(),
            };
        }

        let intent = match self
            .deps
            .intents
            .build_intent(IntentKind::WithdrawMain {
                wallet_address: wallet.address.clone(),
                destination: wallet.external_address.clone(),
                amount,
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

        self.sign_submit_confirm(op, SagaStep::Withdrawing, intent)
            .await
    }

    /// Remove the now-empty subaccount ledger entries and detach the bots.
    async fn delete_subaccounts(&self, subaccounts: &[(Uuid, SubaccountRef)]) -> StepOutcome {
        let mut reclaimed = Decimal::ZERO;
        for (bot_id, subaccount) in subaccounts {
            match self.deps.venue_ops.close_subaccount(subaccount).await {
                Ok(deposit) => {
                    reclaimed += deposit;
                    if let Err(e) = self.deps.bots.clear_subaccount(*bot_id).await {
                        return StepOutcome::Failed {
                            reason: format!("failed to detach bot {bot_id}: {e}"),
                        };
                    }
                }
                Err(e) => {
                    return StepOutcome::Failed {
                        reason: format!("failed to close {subaccount}: {e}"),
                    }
                }
            }
        }
        if !reclaimed.is_zero() {
            info!(reclaimed = %reclaimed, "Reclaimed subaccount deposits");
        }
        StepOutcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::SagaDeps;
    use chrono::Utc;
    use custody_core::config::ConfirmationConfig;
    use custody_core::testkit::{
        FakeSigner, FakeVenue, MemoryBotStore, MemoryOperationStore, MemoryWalletStore,
    };
    use custody_core::types::{AgentWallet, OpenPosition, TradingBot};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        saga: Arc<LifecycleSaga>,
        venue: Arc<FakeVenue>,
        bots: Arc<MemoryBotStore>,
        operations: Arc<MemoryOperationStore>,
        wallet: AgentWallet,
    }

    fn fixture_with_signer(signer: FakeSigner) -> Fixture {
        let venue = Arc::new(FakeVenue::new());
        let bots = Arc::new(MemoryBotStore::new());
        let wallets = Arc::new(MemoryWalletStore::new());
        let operations = Arc::new(MemoryOperationStore::new());

        let wallet = AgentWallet {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            address: "agent-1".to_string(),
            external_address: "user-1".to_string(),
            available_balance: Decimal::ZERO,
            last_synced_at: None,
            rotated_at: None,
            created_at: Utc::now(),
        };
        wallets.add(wallet.clone());

        let deps = SagaDeps {
            bots: bots.clone(),
            wallets: wallets.clone(),
            operations: operations.clone(),
            ledger: venue.clone(),
            intents: venue.clone(),
            gateway: venue.clone(),
            venue_ops: venue.clone(),
            signer: Arc::new(signer),
        };
        let saga = Arc::new(LifecycleSaga::new(
            deps,
            ConfirmationConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
        ));

        Fixture {
            saga,
            venue,
            bots,
            operations,
            wallet,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_signer(FakeSigner::signing())
    }

    fn add_bot(fx: &Fixture, index: i16, balance: Decimal) -> (Uuid, SubaccountRef) {
        let bot = TradingBot {
            id: Uuid::new_v4(),
            agent_wallet_id: fx.wallet.id,
            name: format!("bot-{index}"),
            active: true,
            leverage: Decimal::new(2, 0),
            subaccount_index: Some(index),
            legacy_address: None,
            cached_equity: balance,
            stats_synced_at: None,
            deleted_at: None,
            created_at: Utc::now(),
        };
        let id = bot.id;
        fx.bots.add(bot);
        let sub = SubaccountRef {
            wallet_address: fx.wallet.address.clone(),
            index,
        };
        fx.venue.set_subaccount(&sub, balance, Decimal::ZERO);
        (id, sub)
    }

    async fn wait_terminal(fx: &Fixture, operation_id: Uuid) -> LifecycleOperation {
        for _ in 0..200 {
            if let Some(op) = fx.operations.get(operation_id).await.unwrap() {
                if op.is_terminal() {
                    return op;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("operation {operation_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn full_reset_runs_every_step_and_withdraws() {
        let fx = fixture();
        let (_, sub_a) = add_bot(&fx, 0, Decimal::new(200, 0));
        let (_, _sub_b) = add_bot(&fx, 1, Decimal::new(100, 0));
        fx.venue.add_position(
            &sub_a,
            OpenPosition {
                position_id: "pos-1".to_string(),
                market: "SOL-PERP".to_string(),
                base_quantity: Decimal::new(5, 0),
                unrealized_pnl: Decimal::ZERO,
            },
        );

        let op_id = fx
            .saga
            .clone()
            .request_reset(fx.wallet.id, ResetScope::Full)
            .await
            .unwrap();
        let op = wait_terminal(&fx, op_id).await;

        assert_eq!(op.result, Some(OperationResult::Success));
        for step in RESET_STEPS {
            assert!(
                op.step_outcome(step).is_some_and(|o| o.is_settled()),
                "step {step} did not settle"
            );
        }
        // 300 swept into main, then withdrawn to the external wallet.
        assert_eq!(
            fx.venue.wallet_balance_of(&fx.wallet.address),
            Decimal::ZERO
        );
        // Bots survive an account reset, detached from their subaccounts.
        for bot in fx.bots.list_for_wallet(fx.wallet.id).await.unwrap() {
            assert_eq!(bot.subaccount_index, None);
            assert!(bot.deleted_at.is_none());
        }
    }

    #[tokio::test]
    async fn account_only_reset_skips_the_withdrawal() {
        let fx = fixture();
        add_bot(&fx, 0, Decimal::new(300, 0));

        let op_id = fx
            .saga
            .clone()
            .request_reset(fx.wallet.id, ResetScope::AccountOnly)
            .await
            .unwrap();
        let op = wait_terminal(&fx, op_id).await;

        assert_eq!(op.result, Some(OperationResult::Success));
        assert!(matches!(
            op.step_outcome(SagaStep::Withdrawing),
            Some(StepOutcome::Skipped { .. })
        ));
        // Funds stay in the agent wallet's main balance.
        assert_eq!(
            fx.venue.wallet_balance_of(&fx.wallet.address),
            Decimal::new(300, 0)
        );
    }

    #[tokio::test]
    async fn failure_mid_flow_yields_partial_success_with_ordered_log() {
        let fx = fixture();
        add_bot(&fx, 0, Decimal::new(300, 0));
        // Sweeping succeeds, the withdrawal submission is rejected.
        fx.venue.set_failure("submit", "insufficient collateral for withdrawal");

        let op_id = fx
            .saga
            .clone()
            .request_reset(fx.wallet.id, ResetScope::Full)
            .await
            .unwrap();
        let op = wait_terminal(&fx, op_id).await;

        assert_eq!(op.result, Some(OperationResult::PartialSuccess));
        assert_eq!(op.step_outcome(SagaStep::Closing), Some(&StepOutcome::Ok));
        assert_eq!(op.step_outcome(SagaStep::Settling), Some(&StepOutcome::Ok));
        assert_eq!(op.step_outcome(SagaStep::Sweeping), Some(&StepOutcome::Ok));
        match op.step_outcome(SagaStep::Withdrawing) {
            Some(StepOutcome::Failed { reason }) => {
                assert!(reason.contains("insufficient collateral"));
            }
            other => panic!("expected failed withdrawal, got {other:?}"),
        }
        // Deleting never ran.
        assert_eq!(op.step_outcome(SagaStep::Deleting), None);
        // The swept $300 sits in the agent wallet, not lost.
        assert_eq!(
            fx.venue.wallet_balance_of(&fx.wallet.address),
            Decimal::new(300, 0)
        );
    }

    #[tokio::test]
    async fn resume_retries_only_the_failed_suffix() {
        let fx = fixture();
        add_bot(&fx, 0, Decimal::new(300, 0));
        fx.venue.set_failure("submit", "stale price feed");

        let op_id = fx
            .saga
            .clone()
            .request_reset(fx.wallet.id, ResetScope::Full)
            .await
            .unwrap();
        let failed = wait_terminal(&fx, op_id).await;
        assert_eq!(failed.result, Some(OperationResult::PartialSuccess));
        let sweeps_before = failed
            .steps
            .iter()
            .filter(|r| r.step == SagaStep::Sweeping)
            .count();
        assert_eq!(sweeps_before, 1);

        // Venue recovers; resume picks up at withdrawing.
        fx.venue.clear_failure("submit");
        fx.saga.clone().resume_reset(op_id).await.unwrap();
        let op = wait_terminal(&fx, op_id).await;

        assert_eq!(op.result, Some(OperationResult::Success));
        // Sweeping was not re-executed: one record, and no double count.
        let sweeps_after = op
            .steps
            .iter()
            .filter(|r| r.step == SagaStep::Sweeping)
            .count();
        assert_eq!(sweeps_after, 1);
        assert_eq!(
            fx.venue.wallet_balance_of(&fx.wallet.address),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn rejected_withdrawal_signature_keeps_prior_steps() {
        let fx = fixture_with_signer(FakeSigner::rejecting());
        add_bot(&fx, 0, Decimal::new(120, 0));

        let op_id = fx
            .saga
            .clone()
            .request_reset(fx.wallet.id, ResetScope::Full)
            .await
            .unwrap();
        let op = wait_terminal(&fx, op_id).await;

        assert_eq!(op.result, Some(OperationResult::PartialSuccess));
        assert_eq!(op.step_outcome(SagaStep::Sweeping), Some(&StepOutcome::Ok));
        match op.step_outcome(SagaStep::Withdrawing) {
            Some(StepOutcome::Failed { reason }) => {
                assert!(reason.contains("rejected"));
            }
            other => panic!("expected rejected withdrawal, got {other:?}"),
        }
        // The swept funds stand; rejection cancels only the current step.
        assert_eq!(
            fx.venue.wallet_balance_of(&fx.wallet.address),
            Decimal::new(120, 0)
        );
    }

    #[tokio::test]
    async fn second_reset_on_same_wallet_is_rejected() {
        let fx = fixture();
        add_bot(&fx, 0, Decimal::new(50, 0));
        // Stall the first run on a failing settle so it stays in flight.
        fx.venue.set_failure("settle_pnl", "market paused");

        let first = fx
            .saga
            .clone()
            .request_reset(fx.wallet.id, ResetScope::Full)
            .await
            .unwrap();

        // Race: the spawned run may or may not have finished; the explicit
        // in-flight check must hold while it has not.
        let second = fx.saga.clone().request_reset(fx.wallet.id, ResetScope::Full).await;
        if let Err(err) = second {
            assert!(matches!(err, Error::OperationInFlight { .. }));
        } else {
            // The first run already terminated; then it must be terminal.
            let op = fx.operations.get(first).await.unwrap().unwrap();
            assert!(op.is_terminal());
        }
    }

    #[tokio::test]
    async fn first_step_failure_with_nothing_settled_is_failed() {
        let fx = fixture();
        let (_, sub) = add_bot(&fx, 0, Decimal::new(50, 0));
        fx.venue.add_position(
            &sub,
            OpenPosition {
                position_id: "pos-1".to_string(),
                market: "ETH-PERP".to_string(),
                base_quantity: Decimal::new(1, 0),
                unrealized_pnl: Decimal::ZERO,
            },
        );
        fx.venue.set_failure("close_position", "reduce-only mode");

        let op_id = fx
            .saga
            .clone()
            .request_reset(fx.wallet.id, ResetScope::Full)
            .await
            .unwrap();
        let op = wait_terminal(&fx, op_id).await;

        assert_eq!(op.result, Some(OperationResult::Failed));
        match op.step_outcome(SagaStep::Closing) {
            Some(StepOutcome::Failed { reason }) => {
                assert!(reason.contains("1 of 1 positions"));
            }
            other => panic!("expected failed closing, got {other:?}"),
        }
    }
}
