//! Engine configuration.
//!
//! All settings can be configured via environment variables:
//! - `ROUTING_MAX_COMMIT_RETRIES`: optimistic commit attempts after a concurrent write (default: 3)
//! - `ROUTING_NUMBER_PREFIX`: leading token of routing numbers (default: RTG)
//! - `ROUTING_SEQUENCE_WIDTH`: zero padding of the routing-number sequence (default: 3)
//! - `ROUTING_RESEQUENCE_START`: first number assigned by a resequence (default: 10)
//! - `ROUTING_RESEQUENCE_STEP`: gap between resequenced numbers (default: 10)
//! - `LOG_FORMAT`: "json" or "pretty" (default: json)

use tracing_subscriber::util::TryInitError;

use crate::identifiers::RoutingNumberFormat;
use crate::telemetry::{self, LogFormat};

/// Configuration shared by the engine components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Reload-and-retry budget when a commit loses a revision race.
    pub max_commit_retries: u32,
    /// Leading token of routing numbers.
    pub routing_number_prefix: String,
    /// Zero padding of the routing-number sequence.
    pub sequence_width: usize,
    /// Number given to the first step by a resequence.
    pub resequence_start: u32,
    /// Gap between consecutive resequenced step numbers.
    pub resequence_increment: u32,
    /// Log output format used by [`EngineConfig::init_tracing`].
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 3,
            routing_number_prefix: "RTG".to_string(),
            sequence_width: 3,
            resequence_start: 10,
            resequence_increment: 10,
            log_format: LogFormat::Json,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_commit_retries: std::env::var("ROUTING_MAX_COMMIT_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_commit_retries),
            routing_number_prefix: std::env::var("ROUTING_NUMBER_PREFIX")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.routing_number_prefix),
            sequence_width: std::env::var("ROUTING_SEQUENCE_WIDTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sequence_width),
            resequence_start: std::env::var("ROUTING_RESEQUENCE_START")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.resequence_start),
            resequence_increment: std::env::var("ROUTING_RESEQUENCE_STEP")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.resequence_increment),
            log_format: LogFormat::from_env(),
        }
    }

    /// Install the global subscriber in the configured [`LogFormat`].
    ///
    /// Fails if a global subscriber is already set.
    pub fn init_tracing(&self) -> Result<(), TryInitError> {
        telemetry::init_tracing(self.log_format)
    }

    /// Routing-number layout for storage backends.
    pub fn number_format(&self) -> RoutingNumberFormat {
        RoutingNumberFormat {
            prefix: self.routing_number_prefix.clone(),
            sequence_width: self.sequence_width,
        }
    }

    /// Step numbers assigned by a resequence of `count` steps.
    ///
    /// Returns `None` if the numbers would overflow.
    pub fn resequence_numbers(&self, count: usize) -> Option<Vec<u32>> {
        (0..count)
            .map(|i| {
                u32::try_from(i)
                    .ok()?
                    .checked_mul(self.resequence_increment)?
                    .checked_add(self.resequence_start)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_commit_retries, 3);
        assert_eq!(config.number_format(), RoutingNumberFormat::default());
        assert_eq!(config.resequence_numbers(3), Some(vec![10, 20, 30]));
        assert_eq!(config.resequence_numbers(0), Some(vec![]));
    }

    #[test]
    fn test_init_tracing_installs_once() {
        let config = EngineConfig {
            log_format: LogFormat::Pretty,
            ..EngineConfig::default()
        };
        let _ = config.init_tracing();
        assert!(config.init_tracing().is_err());
        tracing::info!(format = %config.log_format, "subscriber installed");
    }

    #[test]
    fn test_resequence_overflow() {
        let config = EngineConfig {
            resequence_start: u32::MAX - 5,
            ..EngineConfig::default()
        };
        assert_eq!(config.resequence_numbers(1), Some(vec![u32::MAX - 5]));
        assert_eq!(config.resequence_numbers(2), None);
    }
}
