//! Reconciliation poller — keeps cached bot equity honest.
//!
//! Recomputes each bot's balance from the ledger on a timer and on demand
//! after any lifecycle operation, and emits an event when the cached
//! trade-derived figure drifted. Strictly read-only against the ledger.

use custody_core::config::ReconcilerConfig;
use custody_core::db::{BotStore, WalletStore};
use custody_core::types::{OperationTarget, TradingBot};
use custody_core::venue::LedgerQuery;
use custody_core::Result;
use chrono::{DateTime, Utc};
use lifecycle_engine::OperationRegistry;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the reconciliation event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Emitted when a bot's cached equity disagrees with the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationEvent {
    pub bot_id: Uuid,
    pub agent_wallet_id: Uuid,
    /// The trade-derived figure the UI had been showing.
    pub cached_equity: Decimal,
    /// What the ledger actually reports.
    pub authoritative: Decimal,
    pub drift: Decimal,
    pub detected_at: DateTime<Utc>,
}

/// Read-only drift detector between cached and authoritative balances.
pub struct ReconciliationPoller {
    wallets: Arc<dyn WalletStore>,
    bots: Arc<dyn BotStore>,
    ledger: Arc<dyn LedgerQuery>,
    /// Targets with a saga in flight are deferred, not raced.
    registry: Arc<OperationRegistry>,
    config: ReconcilerConfig,
    event_tx: broadcast::Sender<ReconciliationEvent>,
}

impl ReconciliationPoller {
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        bots: Arc<dyn BotStore>,
        ledger: Arc<dyn LedgerQuery>,
        registry: Arc<OperationRegistry>,
        config: ReconcilerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            wallets,
            bots,
            ledger,
            registry,
            config,
            event_tx,
        }
    }

    /// Subscribe to drift events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconciliationEvent> {
        self.event_tx.subscribe()
    }

    /// Reconcile every bot under one wallet. Returns the number of drift
    /// events emitted.
    pub async fn reconcile_wallet(&self, agent_wallet_id: Uuid) -> Result<usize> {
        if self
            .registry
            .is_in_flight(&OperationTarget::AgentWallet(agent_wallet_id))
        {
            debug!(
                agent_wallet_id = %agent_wallet_id,
                "Lifecycle operation in flight; deferring reconciliation"
            );
            return Ok(0);
        }

        let wallet = self.wallets.get_active(agent_wallet_id).await?;
        let bots = self.bots.list_for_wallet(agent_wallet_id).await?;

        let mut drifted = 0usize;
        for bot in &bots {
            if self.registry.is_in_flight(&OperationTarget::Bot(bot.id)) {
                debug!(bot_id = %bot.id, "Bot saga in flight; deferring reconciliation");
                continue;
            }
            match self.reconcile_bot(&wallet.address, bot).await {
                Ok(true) => drifted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(bot_id = %bot.id, error = %e, "Bot reconciliation failed");
                }
            }
        }

        debug!(
            agent_wallet_id = %agent_wallet_id,
            bots = bots.len(),
            drifted = drifted,
            "Reconciliation pass complete"
        );
        Ok(drifted)
    }

    /// Compare one bot's cached equity against the ledger; emit and
    /// correct the cache on drift beyond tolerance.
    async fn reconcile_bot(&self, wallet_address: &str, bot: &TradingBot) -> Result<bool> {
        let Some(subaccount) = bot.subaccount(wallet_address) else {
            return Ok(false);
        };

        let balance = self.ledger.subaccount_balance(&subaccount).await?;
        let authoritative = if balance.exists {
            balance.balance
        } else {
            Decimal::ZERO
        };

        let drift = (authoritative - bot.cached_equity).abs();
        if drift <= self.config.drift_tolerance {
            return Ok(false);
        }

        info!(
            bot_id = %bot.id,
            cached = %bot.cached_equity,
            authoritative = %authoritative,
            drift = %drift,
            "Cached equity drifted from the ledger"
        );
        let _ = self.event_tx.send(ReconciliationEvent {
            bot_id: bot.id,
            agent_wallet_id: bot.agent_wallet_id,
            cached_equity: bot.cached_equity,
            authoritative,
            drift,
            detected_at: Utc::now(),
        });

        // Correct the cache; the ledger itself is never touched.
        self.bots
            .update_cached_equity(bot.id, authoritative)
            .await?;
        Ok(true)
    }

    async fn reconcile_all(&self) {
        let wallets = match self.wallets.list_active().await {
            Ok(wallets) => wallets,
            Err(e) => {
                warn!(error = %e, "Failed to list wallets for reconciliation");
                return;
            }
        };
        for wallet in wallets {
            if let Err(e) = self.reconcile_wallet(wallet.id).await {
                warn!(agent_wallet_id = %wallet.id, error = %e, "Reconciliation failed");
            }
        }
    }
}

/// Spawn the reconciliation loop: a fixed timer plus an on-demand trigger
/// fed by the lifecycle engine after each operation.
pub fn spawn_reconciliation_poller(
    config: ReconcilerConfig,
    poller: Arc<ReconciliationPoller>,
    mut trigger_rx: mpsc::Receiver<Uuid>,
) {
    if !config.enabled {
        info!("Reconciliation poller is disabled");
        return;
    }

    info!(
        interval_secs = config.interval_secs,
        drift_tolerance = %config.drift_tolerance,
        "Spawning reconciliation poller"
    );

    tokio::spawn(async move {
        let interval = Duration::from_secs(config.interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    poller.reconcile_all().await;
                }
                triggered = trigger_rx.recv() => {
                    match triggered {
                        Some(agent_wallet_id) => {
                            debug!(agent_wallet_id = %agent_wallet_id, "On-demand reconciliation");
                            if let Err(e) = poller.reconcile_wallet(agent_wallet_id).await {
                                warn!(agent_wallet_id = %agent_wallet_id, error = %e, "Triggered reconciliation failed");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use custody_core::testkit::{FakeVenue, MemoryBotStore, MemoryWalletStore};
    use custody_core::types::{AgentWallet, SubaccountRef};

    struct Fixture {
        poller: ReconciliationPoller,
        venue: Arc<FakeVenue>,
        bots: Arc<MemoryBotStore>,
        wallet: AgentWallet,
    }

    fn fixture(tolerance: Decimal) -> Fixture {
        let venue = Arc::new(FakeVenue::new());
        let bots = Arc::new(MemoryBotStore::new());
        let wallets = Arc::new(MemoryWalletStore::new());

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

        let poller = ReconciliationPoller::new(
            wallets,
            bots.clone(),
            venue.clone(),
            Arc::new(OperationRegistry::new()),
            ReconcilerConfig {
                enabled: true,
                interval_secs: 60,
                drift_tolerance: tolerance,
            },
        );
        Fixture {
            poller,
            venue,
            bots,
            wallet,
        }
    }

    fn add_bot(fx: &Fixture, index: i16, cached: Decimal, ledger: Decimal) -> Uuid {
        let bot = TradingBot {
            id: Uuid::new_v4(),
            agent_wallet_id: fx.wallet.id,
            name: format!("bot-{index}"),
            active: true,
            leverage: Decimal::ONE,
            subaccount_index: Some(index),
            legacy_address: None,
            cached_equity: cached,
            stats_synced_at: None,
            deleted_at: None,
            created_at: Utc::now(),
        };
        let id = bot.id;
        fx.bots.add(bot);
        fx.venue.set_subaccount(
            &SubaccountRef {
                wallet_address: fx.wallet.address.clone(),
                index,
            },
            ledger,
            Decimal::ZERO,
        );
        id
    }

    #[tokio::test]
    async fn drift_emits_event_and_corrects_the_cache() {
        let fx = fixture(Decimal::new(1, 2));
        let bot_id = add_bot(&fx, 0, Decimal::new(100, 0), Decimal::new(93, 0));
        let mut events = fx.poller.subscribe();

        let drifted = fx.poller.reconcile_wallet(fx.wallet.id).await.unwrap();
        assert_eq!(drifted, 1);

        let event = events.recv().await.unwrap();
        assert_eq!(event.bot_id, bot_id);
        assert_eq!(event.cached_equity, Decimal::new(100, 0));
        assert_eq!(event.authoritative, Decimal::new(93, 0));
        assert_eq!(event.drift, Decimal::new(7, 0));

        use custody_core::db::BotStore;
        let bot = fx.bots.get(bot_id).await.unwrap().unwrap();
        assert_eq!(bot.cached_equity, Decimal::new(93, 0));
    }

    #[tokio::test]
    async fn drift_within_tolerance_is_quiet() {
        let fx = fixture(Decimal::new(5, 0));
        add_bot(&fx, 0, Decimal::new(100, 0), Decimal::new(97, 0));

        let drifted = fx.poller.reconcile_wallet(fx.wallet.id).await.unwrap();
        assert_eq!(drifted, 0);
    }

    #[tokio::test]
    async fn absent_subaccount_reconciles_to_zero() {
        let fx = fixture(Decimal::new(1, 2));
        let bot_id = add_bot(&fx, 0, Decimal::new(40, 0), Decimal::ZERO);
        // Remove the ledger entry entirely: expected-but-absent subaccount.
        fx.venue
            .state
            .lock()
            .unwrap()
            .subaccounts
            .remove(&(fx.wallet.address.clone(), 0));

        let drifted = fx.poller.reconcile_wallet(fx.wallet.id).await.unwrap();
        assert_eq!(drifted, 1);

        use custody_core::db::BotStore;
        let bot = fx.bots.get(bot_id).await.unwrap().unwrap();
        assert_eq!(bot.cached_equity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn read_failure_skips_the_bot_without_failing_the_pass() {
        let fx = fixture(Decimal::new(1, 2));
        add_bot(&fx, 0, Decimal::new(10, 0), Decimal::new(10, 0));
        let drifting = add_bot(&fx, 1, Decimal::new(100, 0), Decimal::new(50, 0));
        fx.venue.fail_reads(&SubaccountRef {
            wallet_address: fx.wallet.address.clone(),
            index: 1,
        });

        // The failing bot is skipped; the pass itself succeeds.
        let drifted = fx.poller.reconcile_wallet(fx.wallet.id).await.unwrap();
        assert_eq!(drifted, 0);

        use custody_core::db::BotStore;
        let bot = fx.bots.get(drifting).await.unwrap().unwrap();
        assert_eq!(bot.cached_equity, Decimal::new(100, 0));
    }
}
