//! Bot deletion handlers.

use axum::extract::{Path, State};
use axum::Json;
use custody_core::types::{ConfirmDelete, ConfirmDeleteOutcome, DeleteOutcome, SignedTransaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Signed transaction payload delivered by the user's wallet.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct SignedTxBody {
    /// Serialized signed transaction.
    pub payload: String,
    /// The transaction signature (finalize dedupe key).
    pub signature: String,
}

impl From<SignedTxBody> for SignedTransaction {
    fn from(body: SignedTxBody) -> Self {
        SignedTransaction {
            payload: body.payload,
            signature: body.signature,
        }
    }
}

/// Request body for the delete finalize call.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ConfirmDeleteRequest {
    /// Signed sweep transaction, when finalizing a funded delete.
    pub signed_tx: Option<SignedTxBody>,
    /// Signature of a previously submitted transaction, for idempotent
    /// retries.
    pub tx_signature: Option<String>,
    /// Explicit "delete anyway" acknowledgment for legacy bots.
    #[serde(default)]
    pub acknowledge_legacy: bool,
}

/// Start deleting a trading bot.
///
/// The outcome is a tagged union: `deleted` when no funds were associated,
/// `legacy_warning` when the bot pre-dates sub-account isolation, or
/// `sweep_required` with the unsigned withdrawal transaction.
#[utoipa::path(
    post,
    path = "/api/v1/bots/{bot_id}/delete",
    params(
        ("bot_id" = Uuid, Path, description = "Trading bot ID")
    ),
    responses(
        (status = 200, description = "Delete outcome"),
        (status = 404, description = "Bot not found"),
        (status = 409, description = "An operation is already in flight"),
    ),
    tag = "bots"
)]
pub async fn request_delete(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<Json<DeleteOutcome>> {
    let outcome = state.saga.request_delete(bot_id).await?;
    Ok(Json(outcome))
}

/// Finalize a bot deletion.
///
/// Idempotent on the transaction signature: repeating the call with the
/// same signature returns `deleted` again without double processing.
#[utoipa::path(
    post,
    path = "/api/v1/bots/{bot_id}/confirm-delete",
    params(
        ("bot_id" = Uuid, Path, description = "Trading bot ID")
    ),
    request_body = ConfirmDeleteRequest,
    responses(
        (status = 200, description = "Confirm outcome"),
        (status = 404, description = "Bot not found"),
        (status = 422, description = "Missing signature or wrong state"),
    ),
    tag = "bots"
)]
pub async fn confirm_delete(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<Uuid>,
    Json(body): Json<ConfirmDeleteRequest>,
) -> ApiResult<Json<ConfirmDeleteOutcome>> {
    if body.signed_tx.is_none() && body.tx_signature.is_none() && !body.acknowledge_legacy {
        return Err(ApiError::BadRequest(
            "provide a signed transaction, a transaction signature, or a legacy acknowledgment"
                .to_string(),
        ));
    }

    let params = ConfirmDelete {
        signed_tx: body.signed_tx.map(Into::into),
        tx_signature: body.tx_signature,
        acknowledge_legacy: body.acknowledge_legacy,
    };
    let outcome = state.saga.confirm_delete(bot_id, params).await?;
    Ok(Json(outcome))
}
