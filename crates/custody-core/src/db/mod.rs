//! Database access layer for PostgreSQL.
//!
//! Storage is consumed through the `*Store` traits so the lifecycle engine
//! can run against in-memory fakes in tests; the PostgreSQL repositories in
//! the submodules are the production implementations.

pub mod bots;
pub mod operations;
pub mod wallets;

pub use bots::BotRepository;
pub use operations::OperationRepository;
pub use wallets::AgentWalletRepository;

use crate::config::DatabaseConfig;
use crate::types::{AgentWallet, LifecycleOperation, OperationTarget, TradingBot};
use crate::{Error, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::Path;
use uuid::Uuid;

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    Ok(pool)
}

/// Run database migrations from the migrations directory.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(Path::new("./migrations")).await?;
    migrator.run(pool).await?;
    Ok(())
}

/// Storage for custodial agent wallets.
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<AgentWallet>>;

    async fn insert(
        &self,
        user_id: Uuid,
        address: &str,
        external_address: &str,
    ) -> Result<AgentWallet>;

    /// Update the cached available balance after a ledger sync.
    async fn update_cached_balance(&self, id: Uuid, balance: Decimal) -> Result<()>;

    /// Rotate a wallet: stamp the old identity rotated and insert the new
    /// one atomically. Returns the new wallet.
    async fn rotate(&self, old_id: Uuid, new_address: &str) -> Result<AgentWallet>;

    async fn list_active(&self) -> Result<Vec<AgentWallet>>;

    /// Fetch a wallet by id, erroring when absent or already rotated out.
    async fn get_active(&self, id: Uuid) -> Result<AgentWallet> {
        let wallet = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("agent wallet {id}")))?;
        if !wallet.is_active() {
            return Err(Error::precondition(format!(
                "agent wallet {id} was rotated out"
            )));
        }
        Ok(wallet)
    }
}

/// Storage for trading bot records and their subaccount association.
#[async_trait]
pub trait BotStore: Send + Sync {
    /// Fetch a bot by id, including soft-deleted rows.
    async fn get(&self, id: Uuid) -> Result<Option<TradingBot>>;

    /// All live bots under an agent wallet.
    async fn list_for_wallet(&self, agent_wallet_id: Uuid) -> Result<Vec<TradingBot>>;

    /// Soft-delete a bot record. Idempotent.
    async fn soft_delete(&self, id: Uuid) -> Result<()>;

    /// Detach a bot from its subaccount after the ledger entry was closed.
    async fn clear_subaccount(&self, id: Uuid) -> Result<()>;

    /// Update the cached trade-derived equity figure.
    async fn update_cached_equity(&self, id: Uuid, equity: Decimal) -> Result<()>;

    /// Fetch a live (not soft-deleted) bot, erroring when absent.
    async fn get_live(&self, id: Uuid) -> Result<TradingBot> {
        let bot = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("trading bot {id}")))?;
        if bot.deleted_at.is_some() {
            return Err(Error::NotFound(format!("trading bot {id} was deleted")));
        }
        Ok(bot)
    }
}

/// Storage for persisted lifecycle operations.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn insert(&self, op: &LifecycleOperation) -> Result<()>;

    /// Persist the mutable portion of an operation.
    async fn save(&self, op: &LifecycleOperation) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<LifecycleOperation>>;

    /// The non-terminal, non-abandoned operation holding a target, if any.
    async fn find_in_flight(&self, target: &OperationTarget)
        -> Result<Option<LifecycleOperation>>;

    /// Look up an operation by its transaction signature (the finalize
    /// dedupe key).
    async fn find_by_signature(&self, tx_signature: &str) -> Result<Option<LifecycleOperation>>;

    /// Atomically claim a transaction signature for an operation. Returns
    /// false when another operation already recorded the same signature.
    async fn claim_signature(&self, id: Uuid, tx_signature: &str) -> Result<bool>;

    /// Operations parked on a signature across process restarts.
    async fn list_awaiting_signature(&self) -> Result<Vec<LifecycleOperation>>;
}
