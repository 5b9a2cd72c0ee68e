//! Error types for the custody coordinator.

use thiserror::Error;
use uuid::Uuid;

/// Classification of an error returned by the trading venue.
///
/// The venue's own message is always preserved verbatim in
/// [`VenueError::message`]; the kind determines retryability and the
/// human-readable hint shown upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueErrorKind {
    /// Not enough collateral to perform the operation.
    InsufficientCollateral,
    /// The market is paused; retry once it resumes.
    MarketPaused,
    /// The venue's price feed is stale; retry shortly.
    StalePriceFeed,
    /// The market only accepts position-reducing orders.
    ReduceOnly,
    /// The target account was never initialized on the venue.
    UninitializedAccount,
    /// Anything the venue reported that we could not classify.
    Other,
}

impl VenueErrorKind {
    /// Whether the condition is transient and safe to retry without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::MarketPaused | Self::StalePriceFeed)
    }

    /// Short human-readable hint for the UI layer.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::InsufficientCollateral => "insufficient collateral",
            Self::MarketPaused => "market is paused, retry later",
            Self::StalePriceFeed => "price feed is stale, retry later",
            Self::ReduceOnly => "market is in reduce-only mode",
            Self::UninitializedAccount => "account is not initialized on the venue",
            Self::Other => "venue rejected the operation",
        }
    }
}

/// An error reported by the trading venue, preserved verbatim plus a
/// typed classification.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VenueError {
    pub kind: VenueErrorKind,
    /// The venue's message, untouched.
    pub message: String,
}

impl VenueError {
    pub fn new(kind: VenueErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build a venue error from a raw message string, classifying it on a
    /// best-effort basis. Used for venue responses that carry no structured
    /// error code; the classification is a UX hint, never the primary
    /// error channel.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = classify_venue_message(&message);
        Self { kind, message }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for VenueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.hint())
    }
}

/// Best-effort classification of a raw venue error message.
fn classify_venue_message(message: &str) -> VenueErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("insufficient") && (lower.contains("collateral") || lower.contains("funds"))
    {
        VenueErrorKind::InsufficientCollateral
    } else if lower.contains("paused") {
        VenueErrorKind::MarketPaused
    } else if lower.contains("stale") && (lower.contains("price") || lower.contains("oracle")) {
        VenueErrorKind::StalePriceFeed
    } else if lower.contains("reduce only") || lower.contains("reduce-only") {
        VenueErrorKind::ReduceOnly
    } else if lower.contains("not initialized") || lower.contains("uninitialized") {
        VenueErrorKind::UninitializedAccount
    } else {
        VenueErrorKind::Other
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// A precondition failed before any state transition; no side effects.
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    /// The user rejected the signature request.
    #[error("Signature request rejected by signer")]
    SignerRejected,

    /// The venue rejected an operation.
    #[error("Venue error: {0}")]
    Venue(VenueError),

    /// A transaction was submitted but confirmation could not be established.
    /// Never coerced to success or failure; the ledger must be checked.
    #[error("Confirmation ambiguous for transaction {tx_signature}: check ledger")]
    ConfirmationAmbiguous { tx_signature: String },

    /// The bot pre-dates sub-account isolation; its funds sit in an address
    /// the coordinator cannot sweep. Requires explicit user acknowledgment.
    #[error("Legacy custody scheme: funds held in uncontrolled address {address}")]
    LegacyState { address: String },

    /// Another lifecycle operation already holds this target.
    #[error("Operation {operation_id} already in flight for this target")]
    OperationInFlight { operation_id: Uuid },

    /// No usable snapshot data, cached or fresh.
    #[error("Snapshot unavailable: {message}")]
    SnapshotStale { message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl Error {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Whether retrying without user action can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Venue(e) => e.is_retryable(),
            Self::Http(_) | Self::Database(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_venue_messages() {
        assert_eq!(
            classify_venue_message("Error: insufficient collateral for withdrawal"),
            VenueErrorKind::InsufficientCollateral
        );
        assert_eq!(
            classify_venue_message("market PAUSED pending oracle update"),
            VenueErrorKind::MarketPaused
        );
        assert_eq!(
            classify_venue_message("stale price feed, rejecting order"),
            VenueErrorKind::StalePriceFeed
        );
        assert_eq!(
            classify_venue_message("market is in reduce-only mode"),
            VenueErrorKind::ReduceOnly
        );
        assert_eq!(
            classify_venue_message("subaccount not initialized"),
            VenueErrorKind::UninitializedAccount
        );
        assert_eq!(
            classify_venue_message("0x1771: custom program error"),
            VenueErrorKind::Other
        );
    }

    #[test]
    fn retryability_follows_kind() {
        assert!(VenueError::from_message("market paused").is_retryable());
        assert!(VenueError::from_message("stale price from oracle").is_retryable());
        assert!(!VenueError::from_message("insufficient funds").is_retryable());
        assert!(!VenueError::from_message("something else entirely").is_retryable());
    }

    #[test]
    fn venue_message_preserved_verbatim() {
        let raw = "Error 6003: insufficient collateral (margin ratio 0.02)";
        let err = VenueError::from_message(raw);
        assert_eq!(err.message, raw);
        assert_eq!(err.kind, VenueErrorKind::InsufficientCollateral);
    }
}
