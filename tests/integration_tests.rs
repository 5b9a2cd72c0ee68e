//! Integration tests for component interactions.
//!
//! These tests drive the lifecycle engine and the equity monitor together
//! over the in-memory venue, checking the end-to-end custody scenarios.

use chrono::Utc;
use custody_core::config::{ConfirmationConfig, ReconcilerConfig};
use custody_core::testkit::{
    FakeSigner, FakeVenue, MemoryBotStore, MemoryOperationStore, MemoryWalletStore,
};
use custody_core::types::{
    AgentWallet, ConfirmDelete, ConfirmDeleteOutcome, DeleteOutcome, OperationResult, ResetScope,
    SagaStep, SignedTransaction, StepOutcome, SubaccountRef, TradingBot,
};
use equity_monitor::{EquityAggregator, ReconciliationPoller};
use lifecycle_engine::{LifecycleSaga, SagaDeps};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Stack {
    saga: Arc<LifecycleSaga>,
    aggregator: EquityAggregator,
    reconciler: ReconciliationPoller,
    venue: Arc<FakeVenue>,
    bots: Arc<MemoryBotStore>,
    operations: Arc<MemoryOperationStore>,
    wallet: AgentWallet,
}

fn stack() -> Stack {
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

    let saga = Arc::new(LifecycleSaga::new(
        SagaDeps {
            bots: bots.clone(),
            wallets: wallets.clone(),
            operations: operations.clone(),
            ledger: venue.clone(),
            intents: venue.clone(),
            gateway: venue.clone(),
            venue_ops: venue.clone(),
            signer: Arc::new(FakeSigner::signing()),
        },
        ConfirmationConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
    ));

    let aggregator = EquityAggregator::new(
        wallets.clone(),
        bots.clone(),
        venue.clone(),
        saga.registry(),
    );
    let reconciler = ReconciliationPoller::new(
        wallets,
        bots.clone(),
        venue.clone(),
        saga.registry(),
        ReconcilerConfig {
            enabled: true,
            interval_secs: 60,
            drift_tolerance: Decimal::new(1, 2),
        },
    );

    Stack {
        saga,
        aggregator,
        reconciler,
        venue,
        bots,
        operations,
        wallet,
    }
}

fn add_bot(stack: &Stack, index: i16, balance: Decimal) -> Uuid {
    let bot = TradingBot {
        id: Uuid::new_v4(),
        agent_wallet_id: stack.wallet.id,
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
    stack.bots.add(bot);
    stack.venue.set_subaccount(
        &SubaccountRef {
            wallet_address: stack.wallet.address.clone(),
            index,
        },
        balance,
        Decimal::ZERO,
    );
    id
}

async fn wait_terminal(stack: &Stack, operation_id: Uuid) {
    use custody_core::db::OperationStore;
    for _ in 0..200 {
        if let Some(op) = stack.operations.get(operation_id).await.unwrap() {
            if op.is_terminal() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("operation {operation_id} never reached a terminal state");
}

/// The delete scenario: $50 available plus a $120 subaccount. Deleting the
/// bot sweeps the subaccount, and the post-delete snapshot shows
/// available=170, deployed=0, total=170.
#[tokio::test]
async fn delete_scenario_conserves_funds_in_the_snapshot() {
    let stack = stack();
    stack
        .venue
        .set_wallet_balance(&stack.wallet.address, Decimal::new(50, 0));
    let bot_id = add_bot(&stack, 0, Decimal::new(120, 0));

    let before = stack.aggregator.refresh(stack.wallet.id).await.unwrap();
    assert_eq!(before.total_equity, Decimal::new(170, 0));

    let DeleteOutcome::SweepRequired {
        balance,
        unsigned_tx,
        ..
    } = stack.saga.request_delete(bot_id).await.unwrap()
    else {
        panic!("expected sweep required");
    };
    assert_eq!(balance, Decimal::new(120, 0));

    let signed = SignedTransaction {
        payload: unsigned_tx.clone(),
        signature: FakeSigner::signature_for(&unsigned_tx),
    };
    let outcome = stack
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
    assert!(matches!(outcome, ConfirmDeleteOutcome::Deleted));

    let after = stack.aggregator.refresh(stack.wallet.id).await.unwrap();
    assert_eq!(after.available_balance, Decimal::new(170, 0));
    assert_eq!(after.deployed_balance, Decimal::ZERO);
    assert_eq!(after.total_equity, Decimal::new(170, 0));
}

/// The reset scenario: the run fails at withdrawing after closing,
/// settling, and sweeping $300. Terminal partial_success, the step log
/// shows exactly which suffix failed, and the $300 is neither lost nor
/// double-counted on retry.
#[tokio::test]
async fn reset_partial_success_preserves_swept_funds() {
    use custody_core::db::OperationStore;

    let stack = stack();
    add_bot(&stack, 0, Decimal::new(200, 0));
    add_bot(&stack, 1, Decimal::new(100, 0));
    stack
        .venue
        .set_failure("submit", "withdrawal rejected: stale price feed");

    let op_id = stack
        .saga
        .clone()
        .request_reset(stack.wallet.id, ResetScope::Full)
        .await
        .unwrap();
    wait_terminal(&stack, op_id).await;

    let op = stack.operations.get(op_id).await.unwrap().unwrap();
    assert_eq!(op.result, Some(OperationResult::PartialSuccess));
    assert_eq!(op.step_outcome(SagaStep::Closing), Some(&StepOutcome::Ok));
    assert_eq!(op.step_outcome(SagaStep::Settling), Some(&StepOutcome::Ok));
    assert_eq!(op.step_outcome(SagaStep::Sweeping), Some(&StepOutcome::Ok));
    assert!(matches!(
        op.step_outcome(SagaStep::Withdrawing),
        Some(StepOutcome::Failed { .. })
    ));

    // The swept $300 sits in the agent wallet.
    let snapshot = stack.aggregator.refresh(stack.wallet.id).await.unwrap();
    assert_eq!(snapshot.available_balance, Decimal::new(300, 0));
    assert_eq!(snapshot.total_equity, Decimal::new(300, 0));

    // Retrying the failed suffix neither loses nor double-counts.
    stack.venue.clear_failure("submit");
    stack.saga.clone().resume_reset(op_id).await.unwrap();
    wait_terminal(&stack, op_id).await;

    let op = stack.operations.get(op_id).await.unwrap().unwrap();
    assert_eq!(op.result, Some(OperationResult::Success));
    let remaining = stack
        .venue
        .state
        .lock()
        .unwrap()
        .wallet_balances
        .get(&stack.wallet.address)
        .copied()
        .unwrap_or_default();
    assert_eq!(remaining, Decimal::ZERO);
}

/// After a lifecycle operation the reconciliation poller flags stale
/// cached bot statistics and corrects them.
#[tokio::test]
async fn reconciliation_catches_post_operation_drift() {
    let stack = stack();
    let bot_id = add_bot(&stack, 0, Decimal::new(150, 0));

    // The venue moved funds without the cache noticing.
    stack.venue.set_subaccount(
        &SubaccountRef {
            wallet_address: stack.wallet.address.clone(),
            index: 0,
        },
        Decimal::new(90, 0),
        Decimal::ZERO,
    );

    let mut events = stack.reconciler.subscribe();
    let drifted = stack
        .reconciler
        .reconcile_wallet(stack.wallet.id)
        .await
        .unwrap();
    assert_eq!(drifted, 1);

    let event = events.recv().await.unwrap();
    assert_eq!(event.bot_id, bot_id);
    assert_eq!(event.drift, Decimal::new(60, 0));
}

/// Starting a second operation on a busy target is rejected
/// deterministically, never queued.
#[tokio::test]
async fn single_flight_holds_across_flows() {
    let stack = stack();
    let bot_id = add_bot(&stack, 0, Decimal::new(10, 0));

    let DeleteOutcome::SweepRequired { .. } = stack.saga.request_delete(bot_id).await.unwrap()
    else {
        panic!("expected sweep required");
    };

    // Same bot again: rejected.
    assert!(stack.saga.request_delete(bot_id).await.is_err());

    // A wallet-level reset would sweep the same subaccount the parked
    // delete owns; it is rejected too, never interleaved.
    let err = stack
        .saga
        .clone()
        .request_reset(stack.wallet.id, ResetScope::AccountOnly)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        custody_core::Error::OperationInFlight { .. }
    ));
}
