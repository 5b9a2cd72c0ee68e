//! Lifecycle operation handlers: resets, rotation, signature delivery,
//! resumption, and abandonment.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use custody_core::types::{LifecycleOperation, OperationState, ResetScope};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::handlers::bots::SignedTxBody;
use crate::state::AppState;

/// Request body for starting an account reset.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetRequest {
    /// `account_only` keeps funds in the agent wallet; `full` withdraws
    /// them to the external wallet.
    #[schema(value_type = String, example = "full")]
    pub scope: ResetScope,
}

/// Response carrying the operation handle.
#[derive(Debug, Serialize, ToSchema)]
pub struct OperationStarted {
    pub operation_id: Uuid,
}

/// Request body for delivering a signature to a waiting operation.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ProvideSignatureRequest {
    pub signed_tx: SignedTxBody,
}

/// Start a reset of every subaccount under an agent wallet.
///
/// Progress streams on the operations WebSocket until the terminal
/// `complete | partial_success | failed`.
#[utoipa::path(
    post,
    path = "/api/v1/agent-wallets/{wallet_id}/reset",
    params(
        ("wallet_id" = Uuid, Path, description = "Agent wallet ID")
    ),
    request_body = ResetRequest,
    responses(
        (status = 202, description = "Reset started", body = OperationStarted),
        (status = 404, description = "Wallet not found"),
        (status = 409, description = "An operation is already in flight"),
    ),
    tag = "operations"
)]
pub async fn request_reset(
    State(state): State<Arc<AppState>>,
    Path(wallet_id): Path<Uuid>,
    Json(body): Json<ResetRequest>,
) -> ApiResult<(StatusCode, Json<OperationStarted>)> {
    let operation_id = state.saga.clone().request_reset(wallet_id, body.scope).await?;
    Ok((StatusCode::ACCEPTED, Json(OperationStarted { operation_id })))
}

/// Rotate an agent wallet to a fresh custodial identity.
///
/// Requires zero open positions and zero subaccount balances; the
/// residual transfer must confirm before the identity swap happens.
#[utoipa::path(
    post,
    path = "/api/v1/agent-wallets/{wallet_id}/rotate",
    params(
        ("wallet_id" = Uuid, Path, description = "Agent wallet ID")
    ),
    responses(
        (status = 202, description = "Rotation started", body = OperationStarted),
        (status = 404, description = "Wallet not found"),
        (status = 422, description = "Preconditions not met"),
    ),
    tag = "operations"
)]
pub async fn request_rotation(
    State(state): State<Arc<AppState>>,
    Path(wallet_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<OperationStarted>)> {
    let operation_id = state.saga.clone().request_wallet_rotation(wallet_id).await?;
    Ok((StatusCode::ACCEPTED, Json(OperationStarted { operation_id })))
}

/// Inspect an operation, including its ordered step log.
#[utoipa::path(
    get,
    path = "/api/v1/operations/{operation_id}",
    params(
        ("operation_id" = Uuid, Path, description = "Operation ID")
    ),
    responses(
        (status = 200, description = "Operation record"),
        (status = 404, description = "Operation not found"),
    ),
    tag = "operations"
)]
pub async fn get_operation(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<Uuid>,
) -> ApiResult<Json<LifecycleOperation>> {
    let op = state.saga.get_operation(operation_id).await?;
    Ok(Json(op))
}

/// Deliver a signed transaction to an operation parked on the signer.
#[utoipa::path(
    post,
    path = "/api/v1/operations/{operation_id}/signature",
    params(
        ("operation_id" = Uuid, Path, description = "Operation ID")
    ),
    request_body = ProvideSignatureRequest,
    responses(
        (status = 202, description = "Signature delivered to the saga"),
        (status = 404, description = "Operation not found"),
        (status = 409, description = "No saga is waiting; resume the operation first"),
    ),
    tag = "operations"
)]
pub async fn provide_signature(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<Uuid>,
    Json(body): Json<ProvideSignatureRequest>,
) -> ApiResult<StatusCode> {
    // Validate the operation exists and is actually waiting.
    let op = state.saga.get_operation(operation_id).await?;
    if op.state != OperationState::AwaitingSignature {
        return Err(ApiError::Conflict(format!(
            "operation {operation_id} is not awaiting a signature"
        )));
    }

    if state
        .signature_gateway
        .provide(operation_id, body.signed_tx.into())
    {
        Ok(StatusCode::ACCEPTED)
    } else {
        // Parked in storage but no waiter in this process (restart).
        // Resuming re-enters the saga, which parks a fresh waiter.
        Err(ApiError::Conflict(format!(
            "no saga is waiting on operation {operation_id} in this process; resume it first"
        )))
    }
}

/// Reject the pending signature request of an operation.
///
/// Cancels only the current step; prior confirmed steps stand.
#[utoipa::path(
    post,
    path = "/api/v1/operations/{operation_id}/reject",
    params(
        ("operation_id" = Uuid, Path, description = "Operation ID")
    ),
    responses(
        (status = 200, description = "Signature request rejected"),
        (status = 404, description = "Operation not found"),
        (status = 422, description = "Operation is not awaiting a signature"),
    ),
    tag = "operations"
)]
pub async fn reject_signature(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<Uuid>,
) -> ApiResult<Json<LifecycleOperation>> {
    // A live waiter gets resolved in-process; the saga task records the
    // failure itself. Otherwise fall back to the persisted record.
    if state.signature_gateway.reject(operation_id) {
        for _ in 0..100 {
            let op = state.saga.get_operation(operation_id).await?;
            if op.state != OperationState::AwaitingSignature {
                return Ok(Json(op));
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let op = state.saga.get_operation(operation_id).await?;
        return Ok(Json(op));
    }
    let op = state.saga.reject_signature(operation_id).await?;
    Ok(Json(op))
}

/// Resume an operation that stopped partway: a reset's failed suffix, or
/// a signature wait orphaned by a restart.
#[utoipa::path(
    post,
    path = "/api/v1/operations/{operation_id}/resume",
    params(
        ("operation_id" = Uuid, Path, description = "Operation ID")
    ),
    responses(
        (status = 202, description = "Operation resumed"),
        (status = 404, description = "Operation not found"),
        (status = 422, description = "Nothing to resume"),
    ),
    tag = "operations"
)]
pub async fn resume_operation(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.saga.clone().resume_reset(operation_id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Explicitly abandon a non-terminal operation. Effects of confirmed
/// prior steps stand; the step log records the abandonment.
#[utoipa::path(
    post,
    path = "/api/v1/operations/{operation_id}/abandon",
    params(
        ("operation_id" = Uuid, Path, description = "Operation ID")
    ),
    responses(
        (status = 200, description = "Operation abandoned"),
        (status = 404, description = "Operation not found"),
        (status = 422, description = "Operation already terminal"),
    ),
    tag = "operations"
)]
pub async fn abandon_operation(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<Uuid>,
) -> ApiResult<Json<LifecycleOperation>> {
    // A live waiter must be resolved, or the parked saga task hangs
    // forever. The task then records the cancelled step and terminates
    // the operation itself; wait for that instead of double-finishing.
    if state.signature_gateway.reject(operation_id) {
        for _ in 0..100 {
            let op = state.saga.get_operation(operation_id).await?;
            if op.is_terminal() {
                return Ok(Json(op));
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        return Err(ApiError::Internal(format!(
            "operation {operation_id} did not settle after cancelling its signature wait"
        )));
    }

    let op = state.saga.abandon_operation(operation_id).await?;
    Ok(Json(op))
}
