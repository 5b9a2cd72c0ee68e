//! Configuration management for the custody coordinator.

use crate::{Error, Result};
use serde::Deserialize;
use std::env;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub venue: VenueConfig,
    pub aggregator: AggregatorConfig,
    pub reconciler: ReconcilerConfig,
    pub confirmation: ConfirmationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Endpoints of the external venue collaborators.
#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    /// Ledger query service base URL.
    pub ledger_url: Option<String>,
    /// Transaction build service base URL.
    pub intent_url: Option<String>,
}

/// Knobs for the equity aggregator's polling loop.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    pub enabled: bool,
    /// Interval between snapshot cycles in seconds.
    pub interval_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

/// Knobs for the reconciliation poller.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    /// Interval between reconciliation cycles in seconds.
    pub interval_secs: u64,
    /// Absolute drift (in the settlement asset) below which cached and
    /// authoritative figures are considered in agreement.
    pub drift_tolerance: rust_decimal::Decimal,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            drift_tolerance: rust_decimal::Decimal::new(1, 2), // $0.01
        }
    }
}

/// Bounded retry/backoff policy for transaction confirmation polling.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfig {
    /// Attempts before surfacing "possibly still pending".
    pub max_attempts: u32,
    /// First backoff delay in milliseconds; doubles per attempt.
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 500,
            max_delay_ms: 15_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| Error::Config {
                    message: "DATABASE_URL environment variable not set".to_string(),
                })?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            },
            venue: VenueConfig {
                ledger_url: env::var("LEDGER_URL").ok(),
                intent_url: env::var("INTENT_BUILDER_URL").ok(),
            },
            aggregator: AggregatorConfig {
                enabled: env::var("AGGREGATOR_ENABLED")
                    .map(|v| v != "false")
                    .unwrap_or(true),
                interval_secs: env_parse("AGGREGATOR_INTERVAL_SECS", 30),
            },
            reconciler: ReconcilerConfig {
                enabled: env::var("RECONCILER_ENABLED")
                    .map(|v| v != "false")
                    .unwrap_or(true),
                interval_secs: env_parse("RECONCILER_INTERVAL_SECS", 60),
                drift_tolerance: env_parse(
                    "RECONCILER_DRIFT_TOLERANCE",
                    ReconcilerConfig::default().drift_tolerance,
                ),
            },
            confirmation: ConfirmationConfig {
                max_attempts: env_parse("CONFIRM_MAX_ATTEMPTS", 8),
                base_delay_ms: env_parse("CONFIRM_BASE_DELAY_MS", 500),
                max_delay_ms: env_parse("CONFIRM_MAX_DELAY_MS", 15_000),
            },
        })
    }

    /// Load configuration for testing (with defaults).
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/custody_test".to_string(),
                max_connections: 2,
            },
            venue: VenueConfig {
                ledger_url: None,
                intent_url: None,
            },
            aggregator: AggregatorConfig::default(),
            reconciler: ReconcilerConfig::default(),
            confirmation: ConfirmationConfig::default(),
        }
    }
}
