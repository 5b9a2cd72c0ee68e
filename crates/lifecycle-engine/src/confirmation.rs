//! Shared transaction confirmation plumbing.
//!
//! Venue confirmation latency is not fully bounded, so after the retry
//! budget is spent the outcome is "possibly still pending" — never a hard
//! failure, and never coerced to success.

use custody_core::config::ConfirmationConfig;
use custody_core::venue::{LedgerQuery, TxStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Terminal outcome of a confirmation poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    /// Retry budget exhausted while the ledger still reported the
    /// transaction pending or unknown.
    StillPending,
    Failed { reason: String },
}

/// Polls the ledger for a submitted transaction with bounded
/// exponential backoff.
pub struct Confirmer {
    ledger: Arc<dyn LedgerQuery>,
    config: ConfirmationConfig,
}

impl Confirmer {
    pub fn new(ledger: Arc<dyn LedgerQuery>, config: ConfirmationConfig) -> Self {
        Self { ledger, config }
    }

    /// Poll until the transaction confirms, fails, or the attempt budget
    /// runs out.
    pub async fn confirm(
        &self,
        tx_signature: &str,
        confirmation_hints: &serde_json::Value,
    ) -> ConfirmOutcome {
        let mut delay = Duration::from_millis(self.config.base_delay_ms);
        let max_delay = Duration::from_millis(self.config.max_delay_ms);

        for attempt in 0..self.config.max_attempts {
            match self
                .ledger
                .transaction_status(tx_signature, confirmation_hints)
                .await
            {
                Ok(TxStatus::Confirmed) => {
                    debug!(tx_signature, attempt = attempt + 1, "Transaction confirmed");
                    return ConfirmOutcome::Confirmed;
                }
                Ok(TxStatus::Failed { reason }) => {
                    warn!(tx_signature, reason = %reason, "Transaction failed on the venue");
                    return ConfirmOutcome::Failed { reason };
                }
                Ok(TxStatus::Pending) | Ok(TxStatus::Unknown) => {
                    debug!(
                        tx_signature,
                        attempt = attempt + 1,
                        "Transaction not yet confirmed"
                    );
                }
                Err(e) => {
                    warn!(
                        tx_signature,
                        attempt = attempt + 1,
                        error = %e,
                        "Confirmation poll failed, backing off"
                    );
                }
            }

            if attempt + 1 < self.config.max_attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
        }

        warn!(
            tx_signature,
            attempts = self.config.max_attempts,
            "Confirmation budget exhausted; transaction possibly still pending"
        );
        ConfirmOutcome::StillPending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::testkit::FakeVenue;
    use custody_core::types::SignedTransaction;
    use custody_core::venue::VenueGateway;

    fn fast_config(max_attempts: u32) -> ConfirmationConfig {
        ConfirmationConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[tokio::test]
    async fn confirms_a_submitted_transaction() {
        let venue = Arc::new(FakeVenue::new());
        let signed = SignedTransaction {
            payload: "{}".into(),
            signature: "sig-1".into(),
        };
        venue.submit(&signed).await.unwrap();

        let confirmer = Confirmer::new(venue, fast_config(3));
        let outcome = confirmer.confirm("sig-1", &serde_json::json!({})).await;
        assert_eq!(outcome, ConfirmOutcome::Confirmed);
    }

    #[tokio::test]
    async fn unknown_transaction_surfaces_still_pending() {
        let venue = Arc::new(FakeVenue::new());
        let confirmer = Confirmer::new(venue, fast_config(3));

        let outcome = confirmer.confirm("sig-missing", &serde_json::json!({})).await;
        assert_eq!(outcome, ConfirmOutcome::StillPending);
    }

    #[tokio::test]
    async fn venue_failure_is_reported_verbatim() {
        let venue = Arc::new(FakeVenue::new());
        venue.set_tx_status(
            "sig-bad",
            custody_core::venue::TxStatus::Failed {
                reason: "slippage exceeded".into(),
            },
        );

        let confirmer = Confirmer::new(venue, fast_config(3));
        let outcome = confirmer.confirm("sig-bad", &serde_json::json!({})).await;
        assert_eq!(
            outcome,
            ConfirmOutcome::Failed {
                reason: "slippage exceeded".into()
            }
        );
    }

    #[tokio::test]
    async fn pending_then_confirmed_resolves_within_budget() {
        let venue = Arc::new(FakeVenue::new());
        venue.set_tx_status("sig-slow", custody_core::venue::TxStatus::Pending);

        let confirmer = Confirmer::new(venue.clone(), fast_config(5));
        let handle = tokio::spawn(async move {
            confirmer.confirm("sig-slow", &serde_json::json!({})).await
        });

        // Flip to confirmed while the poller is backing off.
        tokio::time::sleep(Duration::from_millis(2)).await;
        venue.set_tx_status("sig-slow", custody_core::venue::TxStatus::Confirmed);

        assert_eq!(handle.await.unwrap(), ConfirmOutcome::Confirmed);
    }
}
