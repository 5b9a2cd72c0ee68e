//! PostgreSQL storage for agent wallets.

use crate::db::WalletStore;
use crate::types::AgentWallet;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// PostgreSQL-backed repository for custodial agent wallets.
pub struct AgentWalletRepository {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct AgentWalletRow {
    id: Uuid,
    user_id: Uuid,
    address: String,
    external_address: String,
    available_balance: Decimal,
    last_synced_at: Option<DateTime<Utc>>,
    rotated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<AgentWalletRow> for AgentWallet {
    fn from(r: AgentWalletRow) -> Self {
        AgentWallet {
            id: r.id,
            user_id: r.user_id,
            address: r.address,
            external_address: r.external_address,
            available_balance: r.available_balance,
            last_synced_at: r.last_synced_at,
            rotated_at: r.rotated_at,
            created_at: r.created_at,
        }
    }
}

const WALLET_COLUMNS: &str = "id, user_id, address, external_address, available_balance, \
                              last_synced_at, rotated_at, created_at";

impl AgentWalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WalletStore for AgentWalletRepository {
    async fn get(&self, id: Uuid) -> Result<Option<AgentWallet>> {
        let row: Option<AgentWalletRow> = sqlx::query_as(&format!(
            "SELECT {WALLET_COLUMNS} FROM agent_wallets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn insert(
        &self,
        user_id: Uuid,
        address: &str,
        external_address: &str,
    ) -> Result<AgentWallet> {
        let row: AgentWalletRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO agent_wallets (id, user_id, address, external_address, available_balance)
            VALUES ($1, $2, $3, $4, 0)
            RETURNING {WALLET_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(address)
        .bind(external_address)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn update_cached_balance(&self, id: Uuid, balance: Decimal) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agent_wallets
            SET available_balance = $2, last_synced_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(balance)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn rotate(&self, old_id: Uuid, new_address: &str) -> Result<AgentWallet> {
        let mut tx = self.pool.begin().await?;

        let old = sqlx::query(
            "UPDATE agent_wallets SET rotated_at = NOW() WHERE id = $1 AND rotated_at IS NULL \
             RETURNING user_id, external_address",
        )
        .bind(old_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::precondition(format!("agent wallet {old_id} already rotated")))?;

        let user_id: Uuid = old.get("user_id");
        let external_address: String = old.get("external_address");

        let row: AgentWalletRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO agent_wallets (id, user_id, address, external_address, available_balance)
            VALUES ($1, $2, $3, $4, 0)
            RETURNING {WALLET_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(new_address)
        .bind(&external_address)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(row.into())
    }

    async fn list_active(&self) -> Result<Vec<AgentWallet>> {
        let rows: Vec<AgentWalletRow> = sqlx::query_as(&format!(
            "SELECT {WALLET_COLUMNS} FROM agent_wallets WHERE rotated_at IS NULL"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
