//! Bot deletion flow.
//!
//! Deleting a funded bot is never a single irreversible step: the
//! subaccount balance is swept out through build → sign → submit → confirm
//! before the record goes, and the finalize call is idempotent on the
//! transaction signature.

use super::{failure_reason, LifecycleSaga, StepEventStatus};
use custody_core::db::{BotStore, OperationStore, WalletStore};
use custody_core::types::{
    ConfirmDelete, ConfirmDeleteOutcome, DeleteOutcome, LifecycleOperation, OperationKind,
    OperationResult, OperationState, OperationTarget, SagaStep, StepOutcome, TradingBot,
};
use custody_core::venue::{IntentBuilder, IntentKind, LedgerQuery, VenueGateway};
use custody_core::{Error, Result};
use tracing::{info, warn};
use uuid::Uuid;

impl LifecycleSaga {
    /// Start deleting a trading bot.
    ///
    /// Unfunded bots are removed immediately. Funded bots get a parked
    /// sweep operation and `SweepRequired`; legacy bots get
    /// `LegacyWarning` and wait for an explicit acknowledgment.
    pub async fn request_delete(&self, bot_id: Uuid) -> Result<DeleteOutcome> {
        let bot = self.deps.bots.get_live(bot_id).await?;
        let target = OperationTarget::Bot(bot_id);
        self.ensure_single_flight(&target).await?;
        // A wallet-level reset in flight would sweep this same subaccount.
        self.ensure_single_flight(&OperationTarget::AgentWallet(bot.agent_wallet_id))
            .await?;

        let wallet = self.deps.wallets.get_active(bot.agent_wallet_id).await?;

        if bot.is_legacy() {
            let address = bot
                .legacy_address
                .clone()
                .expect("legacy bot carries an address");
            let balance = self.deps.ledger.wallet_balance(&address).await?;
            warn!(
                bot_id = %bot_id,
                address = %address,
                balance = %balance,
                "Delete blocked on legacy custody scheme; explicit acknowledgment required"
            );
            return Ok(DeleteOutcome::LegacyWarning { address, balance });
        }

        let Some(subaccount) = bot.subaccount(&wallet.address) else {
            self.delete_unfunded(&bot).await?;
            return Ok(DeleteOutcome::Deleted);
        };

        let balance = self.deps.ledger.subaccount_balance(&subaccount).await?;
        if !balance.exists {
            // The bot expects a subaccount the ledger does not have. Safe
            // to delete, but worth surfacing in the logs.
            warn!(
                bot_id = %bot_id,
                subaccount = %subaccount,
                "Bot references a subaccount absent on the ledger"
            );
            self.delete_unfunded(&bot).await?;
            return Ok(DeleteOutcome::Deleted);
        }
        if balance.balance.is_zero() {
            self.delete_unfunded(&bot).await?;
            return Ok(DeleteOutcome::Deleted);
        }

        // Funded: build the withdrawal intent and park on the signer.
        let mut op = LifecycleOperation::new(target, OperationKind::Delete);
        self.registry.acquire(target, op.id)?;

        let intent = match self
            .deps
            .intents
            .build_intent(IntentKind::WithdrawSubaccount {
                subaccount: subaccount.clone(),
            })
            .await
        {
            Ok(intent) => intent,
            Err(e) => {
                self.registry.release(&target, op.id);
                return Err(e);
            }
        };

        op.state = OperationState::AwaitingSignature;
        op.current_step = Some(SagaStep::Sweep);
        op.unsigned_tx = Some(intent.unsigned_tx.clone());
        op.confirmation_hints = Some(intent.confirmation_hints);
        if let Err(e) = self.deps.operations.insert(&op).await {
            self.registry.release(&target, op.id);
            return Err(e);
        }
        self.publish(op.id, Some(SagaStep::Sweep), StepEventStatus::AwaitingSignature);

        info!(
            bot_id = %bot_id,
            operation_id = %op.id,
            balance = %balance.balance,
            "Delete requires sweeping the subaccount first"
        );
        Ok(DeleteOutcome::SweepRequired {
            balance: balance.balance,
            operation_id: op.id,
            unsigned_tx: intent.unsigned_tx,
        })
    }

    /// Finalize a delete: submit the signed sweep (first call), confirm it
    /// against the ledger, then soft-delete the bot record.
    ///
    /// Idempotent on the transaction signature: repeating the call with
    /// the same signature returns `Deleted` again without double
    /// processing.
    pub async fn confirm_delete(
        &self,
        bot_id: Uuid,
        params: ConfirmDelete,
    ) -> Result<ConfirmDeleteOutcome> {
        let bot = self
            .deps
            .bots
            .get(bot_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("trading bot {bot_id}")))?;
        let target = OperationTarget::Bot(bot_id);

        if params.acknowledge_legacy {
            return self.delete_legacy_acknowledged(&bot).await;
        }

        let signature = params
            .signed_tx
            .as_ref()
            .map(|t| t.signature.clone())
            .or_else(|| params.tx_signature.clone())
            .ok_or_else(|| {
                Error::precondition("a signed transaction or transaction signature is required")
            })?;

        // Idempotent retry path: this signature was seen before.
        if let Some(existing) = self.deps.operations.find_by_signature(&signature).await? {
            if existing.target != target {
                return Err(Error::precondition(
                    "transaction signature belongs to a different operation",
                ));
            }
            if existing.is_terminal() {
                return Ok(match existing.result {
                    Some(OperationResult::Success) => ConfirmDeleteOutcome::Deleted,
                    _ => ConfirmDeleteOutcome::Failed {
                        reason: failure_reason(&existing),
                    },
                });
            }
            // Submitted earlier, confirmation still open: re-confirm, do
            // not resubmit.
            return self.finalize_sweep(existing, &bot, signature).await;
        }

        // First delivery: an operation must be parked on the signer.
        let mut op = self
            .deps
            .operations
            .find_in_flight(&target)
            .await?
            .ok_or_else(|| {
                Error::precondition("no delete operation awaiting a signature for this bot")
            })?;
        if op.state != OperationState::AwaitingSignature {
            return Err(Error::precondition(format!(
                "operation {} is not awaiting a signature",
                op.id
            )));
        }
        let signed = params.signed_tx.ok_or_else(|| {
            Error::precondition("signed transaction payload required for submission")
        })?;

        let receipt = match self.deps.gateway.submit(&signed).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // Venue rejected the submission outright; bot untouched.
                let reason = e.to_string();
                op.record_step(
                    SagaStep::Sweep,
                    StepOutcome::Failed {
                        reason: reason.clone(),
                    },
                );
                self.finish(&mut op, OperationResult::Failed, None).await?;
                return Ok(ConfirmDeleteOutcome::Failed { reason });
            }
        };

        if !self
            .deps
            .operations
            .claim_signature(op.id, &receipt.tx_signature)
            .await?
        {
            // A concurrent retry already claimed this transaction.
            if let Some(other) = self
                .deps
                .operations
                .find_by_signature(&receipt.tx_signature)
                .await?
            {
                if other.result == Some(OperationResult::Success) {
                    return Ok(ConfirmDeleteOutcome::Deleted);
                }
            }
            return Err(Error::precondition(
                "transaction signature already claimed by another operation",
            ));
        }
        op.tx_signature = Some(receipt.tx_signature.clone());

        self.finalize_sweep(op, &bot, receipt.tx_signature).await
    }

    /// Confirm a submitted sweep and finalize the bot deletion.
    async fn finalize_sweep(
        &self,
        mut op: LifecycleOperation,
        bot: &TradingBot,
        tx_signature: String,
    ) -> Result<ConfirmDeleteOutcome> {
        op.state = OperationState::Confirming;
        op.current_step = Some(SagaStep::Sweep);
        self.deps.operations.save(&op).await?;
        self.publish(op.id, Some(SagaStep::Sweep), StepEventStatus::Confirming);

        let hints = op
            .confirmation_hints
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));

        match self.confirm_outcome(&tx_signature, &hints).await {
            StepOutcome::Ok => {
                if !op
                    .step_outcome(SagaStep::Sweep)
                    .is_some_and(|o| o.is_settled())
                {
                    op.record_step(SagaStep::Sweep, StepOutcome::Ok);
                }
                self.deps.bots.soft_delete(bot.id).await?;
                op.record_step(SagaStep::Finalize, StepOutcome::Ok);
                self.finish(&mut op, OperationResult::Success, Some(bot.agent_wallet_id))
                    .await?;
                info!(
                    bot_id = %bot.id,
                    tx_signature = %tx_signature,
                    "Bot deleted after confirmed sweep"
                );
                Ok(ConfirmDeleteOutcome::Deleted)
            }
            StepOutcome::Pending { tx_signature } => {
                // Ambiguous: leave the operation confirming so a retry with
                // the same signature re-checks the ledger.
                self.deps.operations.save(&op).await?;
                Ok(ConfirmDeleteOutcome::StillPending { tx_signature })
            }
            StepOutcome::Failed { reason } => {
                op.record_step(
                    SagaStep::Sweep,
                    StepOutcome::Failed {
                        reason: reason.clone(),
                    },
                );
                self.finish(&mut op, OperationResult::Failed, None).await?;
                Ok(ConfirmDeleteOutcome::Failed { reason })
            }
            StepOutcome::Skipped { .. } | StepOutcome::Abandoned => unreachable!(),
        }
    }

    /// Remove a bot with no funds behind it.
    async fn delete_unfunded(&self, bot: &TradingBot) -> Result<()> {
        self.deps.bots.soft_delete(bot.id).await?;

        let mut op = LifecycleOperation::new(OperationTarget::Bot(bot.id), OperationKind::Delete);
        op.record_step(SagaStep::Finalize, StepOutcome::Ok);
        op.state = OperationState::Terminal;
        op.result = Some(OperationResult::Success);
        self.deps.operations.insert(&op).await?;
        self.publish(
            op.id,
            None,
            StepEventStatus::Terminal {
                result: OperationResult::Success,
            },
        );

        info!(bot_id = %bot.id, "Bot deleted (no funds associated)");
        Ok(())
    }

    /// Delete a legacy bot after the user explicitly accepted that its
    /// funds stay in the uncontrolled address.
    async fn delete_legacy_acknowledged(&self, bot: &TradingBot) -> Result<ConfirmDeleteOutcome> {
        if !bot.is_legacy() {
            return Err(Error::precondition(
                "bot is not under the legacy custody scheme",
            ));
        }
        warn!(
            bot_id = %bot.id,
            address = bot.legacy_address.as_deref().unwrap_or_default(),
            "Deleting legacy bot with explicit acknowledgment; funds stay in uncontrolled address"
        );
        self.delete_unfunded(bot).await?;
        Ok(ConfirmDeleteOutcome::Deleted)
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
    use custody_core::types::{AgentWallet, SignedTransaction, SubaccountRef};
    use custody_core::venue::TxStatus;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    struct Fixture {
        saga: Arc<LifecycleSaga>,
        venue: Arc<FakeVenue>,
        bots: Arc<MemoryBotStore>,
        wallet: AgentWallet,
    }

    fn fixture() -> Fixture {
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
            operations,
            ledger: venue.clone(),
            intents: venue.clone(),
            gateway: venue.clone(),
            venue_ops: venue.clone(),
            signer: Arc::new(FakeSigner::signing()),
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
            wallet,
        }
    }

    fn add_bot(fx: &Fixture, subaccount_index: Option<i16>, legacy_address: Option<&str>) -> Uuid {
        let bot = custody_core::types::TradingBot {
            id: Uuid::new_v4(),
            agent_wallet_id: fx.wallet.id,
            name: "momentum".to_string(),
            active: true,
            leverage: Decimal::new(3, 0),
            subaccount_index,
            legacy_address: legacy_address.map(str::to_string),
            cached_equity: Decimal::ZERO,
            stats_synced_at: None,
            deleted_at: None,
            created_at: Utc::now(),
        };
        let id = bot.id;
        fx.bots.add(bot);
        id
    }

    fn sign(unsigned_tx: &str) -> SignedTransaction {
        SignedTransaction {
            payload: unsigned_tx.to_string(),
            signature: FakeSigner::signature_for(unsigned_tx),
        }
    }

    #[tokio::test]
    async fn unfunded_bot_deletes_immediately() {
        let fx = fixture();
        let bot_id = add_bot(&fx, None, None);

        let outcome = fx.saga.request_delete(bot_id).await.unwrap();
        assert!(matches!(outcome, DeleteOutcome::Deleted));

        let bot = fx.bots.get(bot_id).await.unwrap().unwrap();
        assert!(bot.deleted_at.is_some());
    }

    #[tokio::test]
    async fn zero_balance_subaccount_deletes_immediately() {
        let fx = fixture();
        let bot_id = add_bot(&fx, Some(0), None);
        let sub = SubaccountRef {
            wallet_address: fx.wallet.address.clone(),
            index: 0,
        };
        fx.venue.set_subaccount(&sub, Decimal::ZERO, Decimal::ZERO);

        let outcome = fx.saga.request_delete(bot_id).await.unwrap();
        assert!(matches!(outcome, DeleteOutcome::Deleted));
    }

    #[tokio::test]
    async fn legacy_bot_surfaces_warning_and_requires_acknowledgment() {
        let fx = fixture();
        let bot_id = add_bot(&fx, None, Some("legacy-addr"));
        fx.venue.set_wallet_balance("legacy-addr", Decimal::new(75, 0));

        let outcome = fx.saga.request_delete(bot_id).await.unwrap();
        match outcome {
            DeleteOutcome::LegacyWarning { address, balance } => {
                assert_eq!(address, "legacy-addr");
                assert_eq!(balance, Decimal::new(75, 0));
            }
            other => panic!("expected legacy warning, got {other:?}"),
        }

        // Bot untouched until the acknowledgment arrives.
        assert!(fx.bots.get(bot_id).await.unwrap().unwrap().deleted_at.is_none());

        let confirmed = fx
            .saga
            .confirm_delete(
                bot_id,
                ConfirmDelete {
                    acknowledge_legacy: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(confirmed, ConfirmDeleteOutcome::Deleted));
        assert!(fx.bots.get(bot_id).await.unwrap().unwrap().deleted_at.is_some());
    }

    #[tokio::test]
    async fn acknowledge_legacy_on_normal_bot_is_a_precondition_error() {
        let fx = fixture();
        let bot_id = add_bot(&fx, Some(0), None);

        let err = fx
            .saga
            .confirm_delete(
                bot_id,
                ConfirmDelete {
                    acknowledge_legacy: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
    }

    #[tokio::test]
    async fn funded_bot_requires_sweep_then_confirms_and_deletes() {
        let fx = fixture();
        let bot_id = add_bot(&fx, Some(0), None);
        let sub = SubaccountRef {
            wallet_address: fx.wallet.address.clone(),
            index: 0,
        };
        fx.venue.set_wallet_balance(&fx.wallet.address, Decimal::new(50, 0));
        fx.venue.set_subaccount(&sub, Decimal::new(120, 0), Decimal::ZERO);

        let outcome = fx.saga.request_delete(bot_id).await.unwrap();
        let unsigned_tx = match outcome {
            DeleteOutcome::SweepRequired {
                balance,
                unsigned_tx,
                ..
            } => {
                assert_eq!(balance, Decimal::new(120, 0));
                unsigned_tx
            }
            other => panic!("expected sweep required, got {other:?}"),
        };

        // Bot must still exist while the sweep is unconfirmed.
        assert!(fx.bots.get(bot_id).await.unwrap().unwrap().deleted_at.is_none());

        let confirmed = fx
            .saga
            .confirm_delete(
                bot_id,
                ConfirmDelete {
                    signed_tx: Some(sign(&unsigned_tx)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(confirmed, ConfirmDeleteOutcome::Deleted));

        // Funds moved into the agent wallet: 50 + 120.
        assert_eq!(
            fx.venue.wallet_balance_of(&fx.wallet.address),
            Decimal::new(170, 0)
        );
        assert!(fx.bots.get(bot_id).await.unwrap().unwrap().deleted_at.is_some());
    }

    #[tokio::test]
    async fn confirm_delete_is_idempotent_on_the_same_signature() {
        let fx = fixture();
        let bot_id = add_bot(&fx, Some(1), None);
        let sub = SubaccountRef {
            wallet_address: fx.wallet.address.clone(),
            index: 1,
        };
        fx.venue.set_subaccount(&sub, Decimal::new(40, 0), Decimal::ZERO);

        let DeleteOutcome::SweepRequired { unsigned_tx, .. } =
            fx.saga.request_delete(bot_id).await.unwrap()
        else {
            panic!("expected sweep required");
        };
        let signed = sign(&unsigned_tx);

        let first = fx
            .saga
            .confirm_delete(
                bot_id,
                ConfirmDelete {
                    signed_tx: Some(signed.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(first, ConfirmDeleteOutcome::Deleted));
        assert_eq!(fx.venue.submitted_count(), 1);

        // Retry with the same signature: deleted again, nothing resubmitted.
        let second = fx
            .saga
            .confirm_delete(
                bot_id,
                ConfirmDelete {
                    signed_tx: Some(signed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(second, ConfirmDeleteOutcome::Deleted));
        assert_eq!(fx.venue.submitted_count(), 1);

        // Signature alone (client lost the payload) also works.
        let third = fx
            .saga
            .confirm_delete(
                bot_id,
                ConfirmDelete {
                    tx_signature: Some(FakeSigner::signature_for(&unsigned_tx)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(third, ConfirmDeleteOutcome::Deleted));
        assert_eq!(fx.venue.submitted_count(), 1);
    }

    #[tokio::test]
    async fn second_delete_request_is_rejected_while_one_is_in_flight() {
        let fx = fixture();
        let bot_id = add_bot(&fx, Some(0), None);
        let sub = SubaccountRef {
            wallet_address: fx.wallet.address.clone(),
            index: 0,
        };
        fx.venue.set_subaccount(&sub, Decimal::new(10, 0), Decimal::ZERO);

        let DeleteOutcome::SweepRequired { operation_id, .. } =
            fx.saga.request_delete(bot_id).await.unwrap()
        else {
            panic!("expected sweep required");
        };

        let err = fx.saga.request_delete(bot_id).await.unwrap_err();
        match err {
            Error::OperationInFlight { operation_id: held } => assert_eq!(held, operation_id),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn ambiguous_confirmation_stays_pending_and_retry_completes() {
        let fx = fixture();
        let bot_id = add_bot(&fx, Some(0), None);
        let sub = SubaccountRef {
            wallet_address: fx.wallet.address.clone(),
            index: 0,
        };
        fx.venue.set_subaccount(&sub, Decimal::new(10, 0), Decimal::ZERO);

        let DeleteOutcome::SweepRequired { unsigned_tx, .. } =
            fx.saga.request_delete(bot_id).await.unwrap()
        else {
            panic!("expected sweep required");
        };
        let signed = sign(&unsigned_tx);

        // Ledger keeps reporting pending: outcome is ambiguous, bot stays.
        fx.venue.set_tx_status(&signed.signature, TxStatus::Pending);
        let outcome = fx
            .saga
            .confirm_delete(
                bot_id,
                ConfirmDelete {
                    signed_tx: Some(signed.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ConfirmDeleteOutcome::StillPending { .. }));
        assert!(fx.bots.get(bot_id).await.unwrap().unwrap().deleted_at.is_none());

        // Ledger catches up; the retry finalizes without resubmitting.
        fx.venue.set_tx_status(&signed.signature, TxStatus::Confirmed);
        let retry = fx
            .saga
            .confirm_delete(
                bot_id,
                ConfirmDelete {
                    tx_signature: Some(signed.signature.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(retry, ConfirmDeleteOutcome::Deleted));
        assert_eq!(fx.venue.submitted_count(), 1);
    }

    #[tokio::test]
    async fn rejected_signature_fails_the_operation_and_leaves_the_bot() {
        let fx = fixture();
        let bot_id = add_bot(&fx, Some(0), None);
        let sub = SubaccountRef {
            wallet_address: fx.wallet.address.clone(),
            index: 0,
        };
        fx.venue.set_subaccount(&sub, Decimal::new(10, 0), Decimal::ZERO);

        let DeleteOutcome::SweepRequired { operation_id, .. } =
            fx.saga.request_delete(bot_id).await.unwrap()
        else {
            panic!("expected sweep required");
        };

        let op = fx.saga.reject_signature(operation_id).await.unwrap();
        assert_eq!(op.result, Some(OperationResult::Failed));
        assert!(fx.bots.get(bot_id).await.unwrap().unwrap().deleted_at.is_none());

        // The target is free again for a fresh attempt.
        let outcome = fx.saga.request_delete(bot_id).await.unwrap();
        assert!(matches!(outcome, DeleteOutcome::SweepRequired { .. }));
    }

    #[tokio::test]
    async fn venue_rejection_on_submit_fails_without_deleting() {
        let fx = fixture();
        let bot_id = add_bot(&fx, Some(0), None);
        let sub = SubaccountRef {
            wallet_address: fx.wallet.address.clone(),
            index: 0,
        };
        fx.venue.set_subaccount(&sub, Decimal::new(10, 0), Decimal::ZERO);
        fx.venue.set_failure("submit", "market paused pending oracle update");

        let DeleteOutcome::SweepRequired { unsigned_tx, .. } =
            fx.saga.request_delete(bot_id).await.unwrap()
        else {
            panic!("expected sweep required");
        };

        let outcome = fx
            .saga
            .confirm_delete(
                bot_id,
                ConfirmDelete {
                    signed_tx: Some(sign(&unsigned_tx)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        match outcome {
            ConfirmDeleteOutcome::Failed { reason } => {
                assert!(reason.contains("market paused"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(fx.bots.get(bot_id).await.unwrap().unwrap().deleted_at.is_none());
    }
}
