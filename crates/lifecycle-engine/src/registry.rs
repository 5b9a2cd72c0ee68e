//! Single-flight admission control for lifecycle operations.

use custody_core::types::OperationTarget;
use custody_core::{Error, Result};
use dashmap::DashMap;
use uuid::Uuid;

/// Tracks which targets currently have a saga in flight in this process.
///
/// At most one operation may hold a TradingBot or AgentWallet at a time; a
/// second request is rejected deterministically, never queued. Suspended
/// operations (awaiting a signature across restarts) are covered by the
/// persisted operation table; this registry guards the running process.
#[derive(Default)]
pub struct OperationRegistry {
    in_flight: DashMap<OperationTarget, Uuid>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a target for an operation. Fails with `OperationInFlight`
    /// when another operation already holds it.
    pub fn acquire(&self, target: OperationTarget, operation_id: Uuid) -> Result<()> {
        match self.in_flight.entry(target) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Err(Error::OperationInFlight {
                operation_id: *existing.get(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(operation_id);
                Ok(())
            }
        }
    }

    /// Release a target. Only the holding operation may release it.
    pub fn release(&self, target: &OperationTarget, operation_id: Uuid) {
        self.in_flight
            .remove_if(target, |_, held| *held == operation_id);
    }

    /// The operation currently holding a target, if any.
    pub fn holder(&self, target: &OperationTarget) -> Option<Uuid> {
        self.in_flight.get(target).map(|entry| *entry.value())
    }

    /// Whether any operation in this process holds the target.
    pub fn is_in_flight(&self, target: &OperationTarget) -> bool {
        self.in_flight.contains_key(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_with_holder_id() {
        let registry = OperationRegistry::new();
        let target = OperationTarget::Bot(Uuid::new_v4());
        let first = Uuid::new_v4();

        registry.acquire(target, first).unwrap();

        let err = registry.acquire(target, Uuid::new_v4()).unwrap_err();
        match err {
            Error::OperationInFlight { operation_id } => assert_eq!(operation_id, first),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn release_frees_the_target() {
        let registry = OperationRegistry::new();
        let target = OperationTarget::AgentWallet(Uuid::new_v4());
        let op = Uuid::new_v4();

        registry.acquire(target, op).unwrap();
        assert!(registry.is_in_flight(&target));

        registry.release(&target, op);
        assert!(!registry.is_in_flight(&target));
        registry.acquire(target, Uuid::new_v4()).unwrap();
    }

    #[test]
    fn release_by_non_holder_is_ignored() {
        let registry = OperationRegistry::new();
        let target = OperationTarget::Bot(Uuid::new_v4());
        let holder = Uuid::new_v4();

        registry.acquire(target, holder).unwrap();
        registry.release(&target, Uuid::new_v4());

        assert_eq!(registry.holder(&target), Some(holder));
    }

    #[test]
    fn distinct_targets_do_not_contend() {
        let registry = OperationRegistry::new();
        let bot = OperationTarget::Bot(Uuid::new_v4());
        let wallet = OperationTarget::AgentWallet(Uuid::new_v4());

        registry.acquire(bot, Uuid::new_v4()).unwrap();
        registry.acquire(wallet, Uuid::new_v4()).unwrap();
    }
}
