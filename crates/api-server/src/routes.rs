//! API route definitions.

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers::{bots, health, operations, snapshot};
use crate::state::AppState;
use crate::websocket;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Agent Custody API",
        version = "1.0.0",
        description = "Capital custody lifecycle coordinator for automated trading agents"
    ),
    paths(
        health::health_check,
        health::readiness,
        bots::request_delete,
        bots::confirm_delete,
        operations::request_reset,
        operations::request_rotation,
        operations::get_operation,
        operations::provide_signature,
        operations::reject_signature,
        operations::resume_operation,
        operations::abandon_operation,
        snapshot::get_snapshot,
        snapshot::refresh_snapshot,
    ),
    components(
        schemas(
            crate::error::ErrorResponse,
            health::HealthResponse,
            bots::SignedTxBody,
            bots::ConfirmDeleteRequest,
            operations::ResetRequest,
            operations::OperationStarted,
            operations::ProvideSignatureRequest,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "bots", description = "Bot deletion lifecycle"),
        (name = "operations", description = "Reset and rotation sagas"),
        (name = "snapshot", description = "Capital snapshots"),
        (name = "websocket", description = "Real-time progress streams"),
    )
)]
pub struct ApiDoc;

/// Create the main router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness))

        // Bot deletion lifecycle
        .route("/api/v1/bots/{bot_id}/delete", post(bots::request_delete))
        .route("/api/v1/bots/{bot_id}/confirm-delete", post(bots::confirm_delete))

        // Reset and rotation sagas
        .route("/api/v1/agent-wallets/{wallet_id}/reset", post(operations::request_reset))
        .route("/api/v1/agent-wallets/{wallet_id}/rotate", post(operations::request_rotation))
        .route("/api/v1/operations/{operation_id}", get(operations::get_operation))
        .route("/api/v1/operations/{operation_id}/signature", post(operations::provide_signature))
        .route("/api/v1/operations/{operation_id}/reject", post(operations::reject_signature))
        .route("/api/v1/operations/{operation_id}/resume", post(operations::resume_operation))
        .route("/api/v1/operations/{operation_id}/abandon", post(operations::abandon_operation))

        // Capital snapshots
        .route("/api/v1/agent-wallets/{wallet_id}/snapshot", get(snapshot::get_snapshot))
        .route("/api/v1/agent-wallets/{wallet_id}/snapshot/refresh", post(snapshot::refresh_snapshot))

        // WebSocket endpoints
        .route("/api/v1/ws/operations", get(websocket::ws_operations_handler))
        .route("/api/v1/ws/reconciliation", get(websocket::ws_reconciliation_handler))

        // Swagger UI
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}
