//! Application state shared across handlers.

use custody_core::config::Config;
use custody_core::db::{
    AgentWalletRepository, BotRepository, OperationRepository,
};
use custody_core::venue::http::VenueHttpClient;
use equity_monitor::{EquityAggregator, ReconciliationPoller};
use lifecycle_engine::{LifecycleSaga, SagaDeps};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::signature_gateway::ChannelSignatureGateway;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: PgPool,
    /// Lifecycle saga coordinator.
    pub saga: Arc<LifecycleSaga>,
    /// Equity aggregator (published capital snapshots).
    pub aggregator: Arc<EquityAggregator>,
    /// Reconciliation poller.
    pub reconciler: Arc<ReconciliationPoller>,
    /// Bridge resolving the saga's signature waits from API calls.
    pub signature_gateway: Arc<ChannelSignatureGateway>,
}

impl AppState {
    /// Wire the coordinator stack.
    ///
    /// Returns the state plus the receiving end of the reconciliation
    /// trigger; the server hands it to the poller when it spawns
    /// background tasks.
    pub fn new(pool: PgPool, config: &Config) -> (Self, mpsc::Receiver<Uuid>) {
        let venue = Arc::new(VenueHttpClient::new(
            config.venue.ledger_url.clone(),
            config.venue.intent_url.clone(),
        ));
        let signature_gateway = Arc::new(ChannelSignatureGateway::new());

        let bots = Arc::new(BotRepository::new(pool.clone()));
        let wallets = Arc::new(AgentWalletRepository::new(pool.clone()));
        let operations = Arc::new(OperationRepository::new(pool.clone()));

        let (reconcile_tx, reconcile_rx) = mpsc::channel(64);

        let saga = Arc::new(
            LifecycleSaga::new(
                SagaDeps {
                    bots: bots.clone(),
                    wallets: wallets.clone(),
                    operations,
                    ledger: venue.clone(),
                    intents: venue.clone(),
                    gateway: venue.clone(),
                    venue_ops: venue.clone(),
                    signer: signature_gateway.clone(),
                },
                config.confirmation.clone(),
            )
            .with_reconcile_trigger(reconcile_tx),
        );

        let aggregator = Arc::new(EquityAggregator::new(
            wallets.clone(),
            bots.clone(),
            venue.clone(),
            saga.registry(),
        ));

        let reconciler = Arc::new(ReconciliationPoller::new(
            wallets,
            bots,
            venue,
            saga.registry(),
            config.reconciler.clone(),
        ));

        (
            Self {
                pool,
                saga,
                aggregator,
                reconciler,
                signature_gateway,
            },
            reconcile_rx,
        )
    }

    /// Create an Arc-wrapped state.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}
