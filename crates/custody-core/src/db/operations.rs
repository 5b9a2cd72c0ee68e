//! PostgreSQL storage for persisted lifecycle operations.
//!
//! One row per saga instance. The step log is stored as ordered JSONB so a
//! resumed process can pick up exactly where the previous one stopped.

use crate::db::OperationStore;
use crate::types::{
    LifecycleOperation, OperationKind, OperationResult, OperationState, OperationTarget,
    ResetScope, SagaStep, StepRecord,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// PostgreSQL-backed repository for lifecycle operation records.
pub struct OperationRepository {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: Uuid,
    target_kind: String,
    target_id: Uuid,
    kind: String,
    state: String,
    current_step: Option<String>,
    steps: serde_json::Value,
    result: Option<String>,
    unsigned_tx: Option<String>,
    confirmation_hints: Option<serde_json::Value>,
    tx_signature: Option<String>,
    scope: Option<String>,
    abandoned_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OperationRow {
    fn into_operation(self) -> Result<LifecycleOperation> {
        let target = match self.target_kind.as_str() {
            "bot" => OperationTarget::Bot(self.target_id),
            "agent_wallet" => OperationTarget::AgentWallet(self.target_id),
            other => {
                return Err(Error::Config {
                    message: format!("unknown operation target kind '{other}'"),
                })
            }
        };
        let kind = OperationKind::from_str(&self.kind).ok_or_else(|| Error::Config {
            message: format!("unknown operation kind '{}'", self.kind),
        })?;
        let state = OperationState::from_str(&self.state).ok_or_else(|| Error::Config {
            message: format!("unknown operation state '{}'", self.state),
        })?;
        let steps: Vec<StepRecord> = serde_json::from_value(self.steps)?;

        Ok(LifecycleOperation {
            id: self.id,
            target,
            kind,
            state,
            current_step: self.current_step.as_deref().and_then(SagaStep::from_str),
            steps,
            result: self.result.as_deref().and_then(OperationResult::from_str),
            unsigned_tx: self.unsigned_tx,
            confirmation_hints: self.confirmation_hints,
            tx_signature: self.tx_signature,
            scope: self.scope.as_deref().and_then(ResetScope::from_str),
            abandoned_at: self.abandoned_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const OPERATION_COLUMNS: &str = "id, target_kind, target_id, kind, state, current_step, steps, \
                                 result, unsigned_tx, confirmation_hints, tx_signature, scope, \
                                 abandoned_at, created_at, updated_at";

impl OperationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OperationStore for OperationRepository {
    async fn insert(&self, op: &LifecycleOperation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO lifecycle_operations (
                id, target_kind, target_id, kind, state, current_step, steps,
                result, unsigned_tx, confirmation_hints, tx_signature, scope,
                abandoned_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(op.id)
        .bind(op.target.kind_str())
        .bind(op.target.id())
        .bind(op.kind.as_str())
        .bind(op.state.as_str())
        .bind(op.current_step.map(|s| s.as_str()))
        .bind(serde_json::to_value(&op.steps)?)
        .bind(op.result.map(|r| r.as_str()))
        .bind(&op.unsigned_tx)
        .bind(&op.confirmation_hints)
        .bind(&op.tx_signature)
        .bind(op.scope.map(|s| s.as_str()))
        .bind(op.abandoned_at)
        .bind(op.created_at)
        .bind(op.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save(&self, op: &LifecycleOperation) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE lifecycle_operations
            SET state = $2, current_step = $3, steps = $4, result = $5,
                unsigned_tx = $6, confirmation_hints = $7, tx_signature = $8,
                abandoned_at = $9, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(op.id)
        .bind(op.state.as_str())
        .bind(op.current_step.map(|s| s.as_str()))
        .bind(serde_json::to_value(&op.steps)?)
        .bind(op.result.map(|r| r.as_str()))
        .bind(&op.unsigned_tx)
        .bind(&op.confirmation_hints)
        .bind(&op.tx_signature)
        .bind(op.abandoned_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<LifecycleOperation>> {
        let row: Option<OperationRow> = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM lifecycle_operations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OperationRow::into_operation).transpose()
    }

    async fn find_in_flight(
        &self,
        target: &OperationTarget,
    ) -> Result<Option<LifecycleOperation>> {
        let row: Option<OperationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {OPERATION_COLUMNS}
            FROM lifecycle_operations
            WHERE target_kind = $1 AND target_id = $2
              AND state != 'terminal' AND abandoned_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(target.kind_str())
        .bind(target.id())
        .fetch_optional(&self.pool)
        .await?;

        row.map(OperationRow::into_operation).transpose()
    }

    async fn find_by_signature(&self, tx_signature: &str) -> Result<Option<LifecycleOperation>> {
        let row: Option<OperationRow> = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM lifecycle_operations WHERE tx_signature = $1"
        ))
        .bind(tx_signature)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OperationRow::into_operation).transpose()
    }

    async fn claim_signature(&self, id: Uuid, tx_signature: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE lifecycle_operations
            SET tx_signature = $2, updated_at = NOW()
            WHERE id = $1 AND (tx_signature IS NULL OR tx_signature = $2)
            "#,
        )
        .bind(id)
        .bind(tx_signature)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_awaiting_signature(&self) -> Result<Vec<LifecycleOperation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {OPERATION_COLUMNS}
            FROM lifecycle_operations
            WHERE state = 'awaiting_signature' AND abandoned_at IS NULL
            ORDER BY created_at
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(OperationRow::into_operation)
            .collect()
    }
}
