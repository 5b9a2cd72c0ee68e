//! Equity aggregator — periodic custody snapshots split by location.
//!
//! Polls the ledger on an interval (and on explicit refresh) and publishes
//! a fresh [`CapitalSnapshot`] wholesale, so readers never see a
//! half-updated available/deployed split. A failed subaccount read reuses
//! the prior cached balance annotated stale; totals never silently drop a
//! subaccount to zero on a transient error.

use custody_core::config::AggregatorConfig;
use custody_core::db::{BotStore, WalletStore};
use custody_core::types::{CapitalSnapshot, OperationTarget, SubaccountSnapshot};
use custody_core::venue::LedgerQuery;
use custody_core::{Error, Result};
use chrono::Utc;
use lifecycle_engine::OperationRegistry;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Aggregates authoritative balances into published capital snapshots.
pub struct EquityAggregator {
    wallets: Arc<dyn WalletStore>,
    bots: Arc<dyn BotStore>,
    ledger: Arc<dyn LedgerQuery>,
    /// Saga targets in flight get annotated stale instead of raced.
    registry: Arc<OperationRegistry>,
    /// Last known per-subaccount balances, keyed by bot.
    balance_cache: RwLock<HashMap<Uuid, Decimal>>,
    /// Published snapshots, replaced wholesale per wallet.
    snapshots: RwLock<HashMap<Uuid, Arc<CapitalSnapshot>>>,
}

impl EquityAggregator {
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        bots: Arc<dyn BotStore>,
        ledger: Arc<dyn LedgerQuery>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            wallets,
            bots,
            ledger,
            registry,
            balance_cache: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Cache-first snapshot read. Refreshes once when nothing is published
    /// yet; errors with `SnapshotStale` when no figure, cached or fresh,
    /// is available.
    pub async fn snapshot(&self, agent_wallet_id: Uuid) -> Result<Arc<CapitalSnapshot>> {
        if let Some(snapshot) = self.snapshots.read().await.get(&agent_wallet_id) {
            return Ok(snapshot.clone());
        }
        self.refresh(agent_wallet_id).await.map_err(|e| {
            warn!(agent_wallet_id = %agent_wallet_id, error = %e, "Snapshot unavailable");
            Error::SnapshotStale {
                message: format!("no snapshot for agent wallet {agent_wallet_id}: {e}"),
            }
        })
    }

    /// Recompute and publish a wallet's snapshot from the ledger.
    pub async fn refresh(&self, agent_wallet_id: Uuid) -> Result<Arc<CapitalSnapshot>> {
        let wallet = self.wallets.get_active(agent_wallet_id).await?;
        let wallet_target = OperationTarget::AgentWallet(agent_wallet_id);

        // A saga owns this wallet right now: the published figures are
        // authoritative-but-stale until it finishes. Do not race it.
        if self.registry.is_in_flight(&wallet_target) {
            if let Some(snapshot) = self.snapshots.read().await.get(&agent_wallet_id) {
                debug!(
                    agent_wallet_id = %agent_wallet_id,
                    "Lifecycle operation in flight; serving prior snapshot"
                );
                return Ok(snapshot.clone());
            }
        }

        let bots = self.bots.list_for_wallet(agent_wallet_id).await?;
        let mut subaccounts = Vec::new();
        let mut deployed = Decimal::ZERO;

        for bot in &bots {
            let Some(subaccount) = bot.subaccount(&wallet.address) else {
                continue;
            };
            let bot_in_flight = self.registry.is_in_flight(&OperationTarget::Bot(bot.id));
            let cached = self.balance_cache.read().await.get(&bot.id).copied();

            let entry = if bot_in_flight && cached.is_some() {
                SubaccountSnapshot {
                    bot_id: bot.id,
                    index: subaccount.index,
                    balance: cached.unwrap(),
                    exists: true,
                    stale: true,
                }
            } else {
                match self.ledger.subaccount_balance(&subaccount).await {
                    Ok(balance) => {
                        self.balance_cache
                            .write()
                            .await
                            .insert(bot.id, balance.balance);
                        SubaccountSnapshot {
                            bot_id: bot.id,
                            index: subaccount.index,
                            balance: balance.balance,
                            exists: balance.exists,
                            stale: bot_in_flight,
                        }
                    }
                    Err(e) => {
                        // Reuse the last known figure; a transient read
                        // failure must not shrink the total.
                        warn!(
                            bot_id = %bot.id,
                            subaccount = %subaccount,
                            error = %e,
                            "Subaccount read failed; reusing cached balance"
                        );
                        SubaccountSnapshot {
                            bot_id: bot.id,
                            index: subaccount.index,
                            balance: cached.unwrap_or(Decimal::ZERO),
                            exists: true,
                            stale: true,
                        }
                    }
                }
            };

            deployed += entry.balance;
            subaccounts.push(entry);
        }

        let (available, available_stale) =
            match self.ledger.wallet_balance(&wallet.address).await {
                Ok(balance) => {
                    if let Err(e) = self
                        .wallets
                        .update_cached_balance(agent_wallet_id, balance)
                        .await
                    {
                        warn!(agent_wallet_id = %agent_wallet_id, error = %e, "Balance cache update failed");
                    }
                    (balance, false)
                }
                Err(e) => {
                    warn!(
                        agent_wallet_id = %agent_wallet_id,
                        error = %e,
                        "Wallet balance read failed; reusing cached figure"
                    );
                    (wallet.available_balance, true)
                }
            };

        let snapshot = Arc::new(CapitalSnapshot {
            agent_wallet_id,
            available_balance: available,
            deployed_balance: deployed,
            total_equity: available + deployed,
            available_stale,
            subaccounts,
            last_updated: Utc::now(),
        });

        self.snapshots
            .write()
            .await
            .insert(agent_wallet_id, snapshot.clone());

        debug!(
            agent_wallet_id = %agent_wallet_id,
            available = %snapshot.available_balance,
            deployed = %snapshot.deployed_balance,
            total = %snapshot.total_equity,
            stale = snapshot.has_stale_figures(),
            "Published capital snapshot"
        );
        Ok(snapshot)
    }

    /// Refresh every active wallet; used by the polling loop.
    pub async fn refresh_all(&self) -> Result<usize> {
        let wallets = self.wallets.list_active().await?;
        let mut refreshed = 0usize;
        for wallet in &wallets {
            match self.refresh(wallet.id).await {
                Ok(_) => refreshed += 1,
                Err(e) => {
                    warn!(agent_wallet_id = %wallet.id, error = %e, "Snapshot refresh failed");
                }
            }
        }
        Ok(refreshed)
    }
}

/// Spawn the aggregator polling loop as a background task.
pub fn spawn_equity_aggregator(config: AggregatorConfig, aggregator: Arc<EquityAggregator>) {
    if !config.enabled {
        info!("Equity aggregator is disabled");
        return;
    }

    info!(
        interval_secs = config.interval_secs,
        "Spawning equity aggregator"
    );

    tokio::spawn(async move {
        let interval = Duration::from_secs(config.interval_secs);
        loop {
            match aggregator.refresh_all().await {
                Ok(refreshed) => {
                    debug!(wallets = refreshed, "Equity aggregation cycle complete");
                }
                Err(e) => {
                    warn!(error = %e, "Equity aggregation cycle failed");
                }
            }
            tokio::time::sleep(interval).await;
        }
    });
}
