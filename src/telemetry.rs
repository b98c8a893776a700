//! Tracing subscriber setup for hosts embedding the engine.
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! the host's choice. [`init_tracing`] installs the standard one:
//!
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//! - `RUST_LOG`: filter directives (default: `routing_engine=info,sqlx=warn`)

use std::fmt;

use tracing_subscriber::{
    fmt::{self as tracing_fmt, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "routing_engine=info,sqlx=warn";

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, span fields flattened.
    #[default]
    Json,
    /// Human-readable multi-field lines.
    Pretty,
}

impl LogFormat {
    /// Parse a format name; anything but "pretty" is JSON.
    pub fn from_str(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("pretty") {
            Self::Pretty
        } else {
            Self::Json
        }
    }

    /// Read `LOG_FORMAT`.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| Self::from_str(&s))
            .unwrap_or_default()
    }

    /// Format name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install a global subscriber with the given format.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .try_init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!(LogFormat::from_str("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str(" PRETTY "), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_str("anything"), LogFormat::Json);
    }
}
