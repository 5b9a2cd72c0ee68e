//! Capital snapshot handlers.

use axum::extract::{Path, State};
use axum::Json;
use custody_core::types::CapitalSnapshot;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

/// Cache-first capital snapshot for an agent wallet.
///
/// `last_updated` bounds the staleness; per-subaccount `stale` flags mark
/// figures served from cache after a failed read or during an in-flight
/// lifecycle operation.
#[utoipa::path(
    get,
    path = "/api/v1/agent-wallets/{wallet_id}/snapshot",
    params(
        ("wallet_id" = Uuid, Path, description = "Agent wallet ID")
    ),
    responses(
        (status = 200, description = "Capital snapshot"),
        (status = 404, description = "Wallet not found"),
        (status = 503, description = "No snapshot available yet"),
    ),
    tag = "snapshot"
)]
pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(wallet_id): Path<Uuid>,
) -> ApiResult<Json<CapitalSnapshot>> {
    let snapshot = state.aggregator.snapshot(wallet_id).await?;
    Ok(Json((*snapshot).clone()))
}

/// Force a fresh ledger read and republish the snapshot.
#[utoipa::path(
    post,
    path = "/api/v1/agent-wallets/{wallet_id}/snapshot/refresh",
    params(
        ("wallet_id" = Uuid, Path, description = "Agent wallet ID")
    ),
    responses(
        (status = 200, description = "Refreshed capital snapshot"),
        (status = 404, description = "Wallet not found"),
    ),
    tag = "snapshot"
)]
pub async fn refresh_snapshot(
    State(state): State<Arc<AppState>>,
    Path(wallet_id): Path<Uuid>,
) -> ApiResult<Json<CapitalSnapshot>> {
    let snapshot = state.aggregator.refresh(wallet_id).await?;
    Ok(Json((*snapshot).clone()))
}
