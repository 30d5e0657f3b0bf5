use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ActivationError;
use crate::kind::{LogLevel, TelemetryKind};
use crate::pattern::{self, SEGMENT_DELIMITER, WILDCARD};
use crate::rule::{normalize_tenant, RuleKey};

/// How long an activation lasts once it starts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ActivationWindow {
    /// No end time.
    #[default]
    Indefinite,
    /// Ends a relative interval after the start.
    For(Duration),
    /// Ends a number of minutes after the start, as written by an operator.
    Minutes(i64),
    /// Ends at an explicit instant.
    Until(DateTime<Utc>),
}

/// Operator request to create or refresh an activation rule.
#[derive(Debug, Clone, PartialEq)]
pub struct EnableRequest {
    pub object_pattern: String,
    pub telemetry_kind: TelemetryKind,
    pub tenant_id: String,
    pub sampling_rate: f64,
    pub min_log_level: Option<LogLevel>,
    /// Defaults to the time of the call.
    pub active_from: Option<DateTime<Utc>>,
    pub window: ActivationWindow,
}

impl EnableRequest {
    pub fn new(
        object_pattern: impl Into<String>,
        telemetry_kind: TelemetryKind,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            object_pattern: object_pattern.into(),
            telemetry_kind,
            tenant_id: tenant_id.into(),
            sampling_rate: 1.0,
            min_log_level: None,
            active_from: None,
            window: ActivationWindow::Indefinite,
        }
    }

    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn min_log_level(mut self, level: LogLevel) -> Self {
        self.min_log_level = Some(level);
        self
    }

    pub fn starting_at(mut self, from: DateTime<Utc>) -> Self {
        self.active_from = Some(from);
        self
    }

    pub fn lasting(mut self, duration: Duration) -> Self {
        self.window = ActivationWindow::For(duration);
        self
    }

    pub fn lasting_minutes(mut self, minutes: i64) -> Self {
        self.window = ActivationWindow::Minutes(minutes);
        self
    }

    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.window = ActivationWindow::Until(end);
        self
    }
}

/// An [`EnableRequest`] that passed validation, with defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedActivation {
    pub key: RuleKey,
    pub sampling_rate: f64,
    pub min_log_level: Option<LogLevel>,
    pub active_from: DateTime<Utc>,
    pub active_to: Option<DateTime<Utc>>,
}

/// Validates a request before anything is persisted.
pub fn validate(request: &EnableRequest, now: DateTime<Utc>) -> Result<ValidatedActivation, ActivationError> {
    let object_pattern = validate_pattern(&request.object_pattern)?;
    let tenant_id = validate_tenant(&request.tenant_id)?;
    validate_sampling_rate(request.sampling_rate)?;

    let active_from = request.active_from.unwrap_or(now);
    let active_to = match request.window {
        ActivationWindow::Indefinite => None,
        ActivationWindow::For(duration) => Some(end_after(active_from, duration)?),
        ActivationWindow::Minutes(count) => Some(end_after(active_from, minutes(count)?)?),
        ActivationWindow::Until(end) => Some(end),
    };
    if let Some(end) = active_to {
        if end <= active_from {
            return Err(ActivationError::InvertedWindow);
        }
    }

    let min_log_level = match request.telemetry_kind {
        TelemetryKind::Log => Some(request.min_log_level.unwrap_or_default()),
        TelemetryKind::Trace | TelemetryKind::Metric => None,
    };

    Ok(ValidatedActivation {
        key: RuleKey {
            telemetry_kind: request.telemetry_kind,
            object_pattern,
            tenant_id,
        },
        sampling_rate: request.sampling_rate,
        min_log_level,
        active_from,
        active_to,
    })
}

/// `count` minutes as a [`Duration`], rejecting counts chrono cannot represent.
pub fn minutes(count: i64) -> Result<Duration, ActivationError> {
    Duration::try_minutes(count).ok_or_else(|| ActivationError::SpanOutOfRange(format!("{count} minutes")))
}

/// The instant `hours` before `now`.
pub fn hours_before(now: DateTime<Utc>, hours: u32) -> Result<DateTime<Utc>, ActivationError> {
    Duration::try_hours(i64::from(hours))
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| ActivationError::SpanOutOfRange(format!("{hours} hours")))
}

/// The instant `days` before `now`.
pub fn days_before(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>, ActivationError> {
    Duration::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| ActivationError::SpanOutOfRange(format!("{days} days")))
}

fn end_after(start: DateTime<Utc>, span: Duration) -> Result<DateTime<Utc>, ActivationError> {
    start
        .checked_add_signed(span)
        .ok_or_else(|| ActivationError::SpanOutOfRange(format!("{} seconds", span.num_seconds())))
}

/// Normalizes a pattern and checks it only uses letters, digits, `.`, `_` and `*`.
pub fn validate_pattern(raw: &str) -> Result<String, ActivationError> {
    let normalized = pattern::normalize(raw);
    if normalized.is_empty() {
        return Err(ActivationError::invalid_pattern(raw, "pattern is empty"));
    }
    if let Some(bad) = normalized
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == SEGMENT_DELIMITER || *c == '_' || *c == WILDCARD))
    {
        return Err(ActivationError::invalid_pattern(
            raw,
            format!("character {bad:?} is not allowed"),
        ));
    }
    Ok(normalized)
}

pub fn validate_tenant(raw: &str) -> Result<String, ActivationError> {
    let tenant = normalize_tenant(raw);
    if tenant.is_empty() || tenant.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ActivationError::InvalidTenant(raw.to_string()));
    }
    Ok(tenant)
}

pub fn validate_sampling_rate(rate: f64) -> Result<(), ActivationError> {
    if rate.is_nan() || !(0.0..=1.0).contains(&rate) {
        return Err(ActivationError::SamplingRateOutOfRange(rate));
    }
    Ok(())
}
