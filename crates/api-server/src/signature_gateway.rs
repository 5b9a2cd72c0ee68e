//! Channel-backed external signer bridge.
//!
//! The saga parks on `await_signature` while the user signs in their own
//! wallet; the signature and rejection endpoints resolve the wait. The
//! wait is user-paced with no timeout — an operation whose process dies
//! mid-wait stays `awaiting_signature` in storage and is re-entered on
//! resume.

use async_trait::async_trait;
use custody_core::types::SignedTransaction;
use custody_core::venue::{SignatureGateway, SignatureOutcome};
use custody_core::{Error, Result};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

/// In-process [`SignatureGateway`] resolved by API calls.
#[derive(Default)]
pub struct ChannelSignatureGateway {
    pending: DashMap<Uuid, oneshot::Sender<SignatureOutcome>>,
}

impl ChannelSignatureGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a signed transaction to a waiting operation. Returns false
    /// when no saga is parked on this operation in this process.
    pub fn provide(&self, operation_id: Uuid, signed_tx: SignedTransaction) -> bool {
        match self.pending.remove(&operation_id) {
            Some((_, waiter)) => {
                info!(operation_id = %operation_id, "Delivering signature to waiting saga");
                waiter.send(SignatureOutcome::Signed(signed_tx)).is_ok()
            }
            None => false,
        }
    }

    /// Reject a waiting signature request. Returns false when no saga is
    /// parked on this operation in this process.
    pub fn reject(&self, operation_id: Uuid) -> bool {
        match self.pending.remove(&operation_id) {
            Some((_, waiter)) => {
                info!(operation_id = %operation_id, "Rejecting signature request");
                waiter.send(SignatureOutcome::Rejected).is_ok()
            }
            None => false,
        }
    }

    /// Whether a saga is currently parked on this operation.
    pub fn is_waiting(&self, operation_id: Uuid) -> bool {
        self.pending.contains_key(&operation_id)
    }
}

#[async_trait]
impl SignatureGateway for ChannelSignatureGateway {
    async fn await_signature(
        &self,
        operation_id: Uuid,
        _unsigned_tx: &str,
    ) -> Result<SignatureOutcome> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(operation_id, tx).is_some() {
            warn!(
                operation_id = %operation_id,
                "Replacing an existing signature waiter for this operation"
            );
        }

        info!(operation_id = %operation_id, "Awaiting external signature (user-paced)");
        match rx.await {
            Ok(outcome) => Ok(outcome),
            // The waiter was dropped without an answer (shutdown or a
            // replacement wait); treat it as a rejection of this step.
            Err(_) => Err(Error::SignerRejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provide_resolves_the_waiting_saga() {
        let gateway = std::sync::Arc::new(ChannelSignatureGateway::new());
        let operation_id = Uuid::new_v4();

        let waiter = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.await_signature(operation_id, "unsigned").await })
        };

        // Wait until the saga has parked.
        for _ in 0..100 {
            if gateway.is_waiting(operation_id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        let signed = SignedTransaction {
            payload: "unsigned".to_string(),
            signature: "sig-1".to_string(),
        };
        assert!(gateway.provide(operation_id, signed.clone()));

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, SignatureOutcome::Signed(signed));
    }

    #[tokio::test]
    async fn reject_resolves_with_rejection() {
        let gateway = std::sync::Arc::new(ChannelSignatureGateway::new());
        let operation_id = Uuid::new_v4();

        let waiter = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.await_signature(operation_id, "unsigned").await })
        };
        for _ in 0..100 {
            if gateway.is_waiting(operation_id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        assert!(gateway.reject(operation_id));
        assert_eq!(waiter.await.unwrap().unwrap(), SignatureOutcome::Rejected);
    }

    #[tokio::test]
    async fn provide_without_waiter_reports_false() {
        let gateway = ChannelSignatureGateway::new();
        assert!(!gateway.provide(
            Uuid::new_v4(),
            SignedTransaction {
                payload: String::new(),
                signature: "sig".to_string(),
            }
        ));
        assert!(!gateway.reject(Uuid::new_v4()));
    }
}
