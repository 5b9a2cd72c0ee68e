//! Core domain types for the custody coordinator.

pub mod bot;
pub mod operation;
pub mod snapshot;
pub mod wallet;

pub use bot::*;
pub use operation::*;
pub use snapshot::*;
pub use wallet::*;
