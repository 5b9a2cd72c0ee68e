//! PostgreSQL storage for trading bots and their subaccount association.

use crate::db::BotStore;
use crate::types::TradingBot;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

/// PostgreSQL-backed repository for trading bot records.
pub struct BotRepository {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct BotRow {
    id: Uuid,
    agent_wallet_id: Uuid,
    name: String,
    active: bool,
    leverage: Decimal,
    subaccount_index: Option<i16>,
    legacy_address: Option<String>,
    cached_equity: Decimal,
    stats_synced_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<BotRow> for TradingBot {
    fn from(r: BotRow) -> Self {
        TradingBot {
            id: r.id,
            agent_wallet_id: r.agent_wallet_id,
            name: r.name,
            active: r.active,
            leverage: r.leverage,
            subaccount_index: r.subaccount_index,
            legacy_address: r.legacy_address,
            cached_equity: r.cached_equity,
            stats_synced_at: r.stats_synced_at,
            deleted_at: r.deleted_at,
            created_at: r.created_at,
        }
    }
}

const BOT_COLUMNS: &str = "id, agent_wallet_id, name, active, leverage, subaccount_index, \
                           legacy_address, cached_equity, stats_synced_at, deleted_at, created_at";

impl BotRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BotStore for BotRepository {
    async fn get(&self, id: Uuid) -> Result<Option<TradingBot>> {
        let row: Option<BotRow> = sqlx::query_as(&format!(
            "SELECT {BOT_COLUMNS} FROM trading_bots WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_for_wallet(&self, agent_wallet_id: Uuid) -> Result<Vec<TradingBot>> {
        let rows: Vec<BotRow> = sqlx::query_as(&format!(
            r#"
            SELECT {BOT_COLUMNS}
            FROM trading_bots
            WHERE agent_wallet_id = $1 AND deleted_at IS NULL
            ORDER BY created_at
            "#
        ))
        .bind(agent_wallet_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE trading_bots SET active = false, deleted_at = COALESCE(deleted_at, NOW()) \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_subaccount(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE trading_bots SET subaccount_index = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_cached_equity(&self, id: Uuid, equity: Decimal) -> Result<()> {
        sqlx::query(
            "UPDATE trading_bots SET cached_equity = $2, stats_synced_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(equity)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
