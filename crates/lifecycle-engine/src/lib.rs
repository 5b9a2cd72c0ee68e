//! Lifecycle Engine
//!
//! The capital custody saga coordinator: delete, reset-account, and
//! agent-wallet rotation flows, plus the shared transaction
//! submit-and-confirm plumbing and the single-flight operation registry.
//!
//! Every flow is forward-only: a step's failure never rolls back prior
//! steps, and each terminal outcome carries the ordered per-step log.

pub mod confirmation;
pub mod registry;
pub mod saga;

pub use confirmation::{ConfirmOutcome, Confirmer};
pub use registry::OperationRegistry;
pub use saga::{LifecycleSaga, SagaDeps, StepEvent, StepEventStatus};
