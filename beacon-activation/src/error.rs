use thiserror::Error;

/// Errors raised by the activation engine.
///
/// Validation variants are operator mistakes and are always surfaced to the
/// caller. `Storage` wraps failures of the persistence backends.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("invalid object pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("unknown telemetry kind: {0}")]
    UnknownTelemetryKind(String),
    #[error("sampling rate {0} is outside [0.0, 1.0]")]
    SamplingRateOutOfRange(f64),
    #[error("activation window end must be after its start")]
    InvertedWindow,
    #[error("time span out of range: {0}")]
    SpanOutOfRange(String),
    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),
    #[error("invalid tenant identifier: {0:?}")]
    InvalidTenant(String),
    #[error("activation rule not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("failed to read seed from {path}")]
    SeedIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse seed from {path}: {message}")]
    SeedParse { path: String, message: String },
    #[error("duplicate activation in seed: {0}")]
    DuplicateSeed(String),
}

impl ActivationError {
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        ActivationError::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error was caused by operator input rather than the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ActivationError::InvalidPattern { .. }
                | ActivationError::UnknownTelemetryKind(_)
                | ActivationError::SamplingRateOutOfRange(_)
                | ActivationError::InvertedWindow
                | ActivationError::SpanOutOfRange(_)
                | ActivationError::UnknownLogLevel(_)
                | ActivationError::InvalidTenant(_)
                | ActivationError::DuplicateSeed(_)
        )
    }
}

impl From<sqlx::Error> for ActivationError {
    fn from(err: sqlx::Error) -> Self {
        ActivationError::Storage(err.to_string())
    }
}

impl From<beacon_core::BeaconError> for ActivationError {
    fn from(err: beacon_core::BeaconError) -> Self {
        ActivationError::Storage(err.to_string())
    }
}
