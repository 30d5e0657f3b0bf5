use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kind::{LogLevel, TelemetryKind};
use crate::pattern;

/// Reserved tenant whose rules apply to every tenant lacking its own match.
pub const GLOBAL_TENANT: &str = "ALL";

/// Canonical form of a tenant identifier; any casing of `ALL` maps to [`GLOBAL_TENANT`].
pub fn normalize_tenant(tenant: &str) -> String {
    let trimmed = tenant.trim();
    if trimmed.eq_ignore_ascii_case(GLOBAL_TENANT) {
        GLOBAL_TENANT.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Uniqueness triple of an activation rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    pub telemetry_kind: TelemetryKind,
    pub object_pattern: String,
    pub tenant_id: String,
}

impl RuleKey {
    /// Builds a key, normalizing the pattern and tenant the same way stored rules are.
    pub fn new(telemetry_kind: TelemetryKind, object_pattern: &str, tenant_id: &str) -> Self {
        Self {
            telemetry_kind,
            object_pattern: pattern::normalize(object_pattern),
            tenant_id: normalize_tenant(tenant_id),
        }
    }
}

impl std::fmt::Display for RuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}@{}",
            self.telemetry_kind, self.object_pattern, self.tenant_id
        )
    }
}

/// Stored decision record controlling whether telemetry is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRule {
    pub id: Uuid,
    pub telemetry_kind: TelemetryKind,
    pub object_pattern: String,
    pub tenant_id: String,
    pub enabled: bool,
    pub active_from: DateTime<Utc>,
    /// `None` means the rule never expires.
    pub active_to: Option<DateTime<Utc>>,
    pub sampling_rate: f64,
    /// Present only for [`TelemetryKind::Log`] rules.
    pub min_log_level: Option<LogLevel>,
    /// Bumped on every write; lets readers discard stale snapshots.
    pub revision: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ActivationRule {
    pub fn key(&self) -> RuleKey {
        RuleKey {
            telemetry_kind: self.telemetry_kind,
            object_pattern: self.object_pattern.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }

    /// Whether `now` lies inside `[active_from, active_to]`.
    pub fn window_contains(&self, now: DateTime<Utc>) -> bool {
        self.active_from <= now && self.active_to.map_or(true, |end| now <= end)
    }

    /// Enabled and inside its activation window.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.window_contains(now)
    }

    /// Whether the window has closed as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.active_to.map_or(false, |end| end < now)
    }

    pub fn specificity(&self) -> i64 {
        pattern::specificity(&self.object_pattern)
    }

    /// Effective log threshold; `Info` when a log rule somehow lacks one.
    pub fn log_threshold(&self) -> LogLevel {
        self.min_log_level.unwrap_or_default()
    }

    /// Timestamp of the last write, used for retention.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}
