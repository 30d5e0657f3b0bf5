//! Telemetry activation control for the Beacon service.
//!
//! Operators store activation rules keyed by telemetry kind, object pattern
//! and tenant. Instrumented code asks the [`ActivationEngine`] on every call
//! whether to emit, and at what sampling rate and minimum log level. The
//! engine reads an in-memory [`RuleCache`] kept current by the
//! [`ActivationStore`], whose every write is captured by the [`AuditTrail`].

mod audit;
mod cache;
mod context;
mod decision;
mod error;
mod kind;
mod loader;
mod maintenance;
mod pattern;
mod postgres;
mod reporting;
mod repository;
mod resolver;
mod rule;
mod service;
mod sink;
mod store;
mod validation;

pub use audit::{AuditOperation, AuditRecord, AuditRepository, AuditTrail, MemoryAuditRepository, RuleSnapshot};
pub use cache::{CachedRule, RuleCache};
pub use context::{AdminContext, SessionContext};
pub use decision::{sample, ActivationEngine, Decision};
pub use error::ActivationError;
pub use kind::{LogLevel, TelemetryKind};
pub use loader::{load_seed, SeedRule};
pub use maintenance::{PurgeReport, DEFAULT_KEEP_DAYS};
pub use pattern::{matches, normalize, specificity, ObjectPattern};
pub use postgres::{ActivationMigrator, PgAuditRepository, PgRuleRepository};
pub use reporting::{ActivationSummary, ActiveConfiguration};
pub use repository::{MemoryRuleRepository, RuleChange, RuleRepository, WritePermit};
pub use resolver::{Resolver, RuleSource};
pub use rule::{normalize_tenant, ActivationRule, RuleKey, GLOBAL_TENANT};
pub use service::{
    ActivationApiBuilder, ActivationServiceConfig, BulkBody, DecisionBody, DisableAllBody, EnableBody,
    ErrorResponse, RuleTarget, ACTOR_HEADER, SESSION_HEADER,
};
pub use sink::{AuditEvent, AuditSeverity, AuditSink, ChannelAuditSink, FanoutAuditSink, SinkError, TracingAuditSink};
pub use store::{ActivationStore, BulkFailure, BulkOutcome};
pub use validation::{validate, ActivationWindow, EnableRequest, ValidatedActivation};

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::audit::{AuditOperation, AuditRecord, RuleSnapshot};
    use crate::context::SessionContext;
    use crate::kind::{LogLevel, TelemetryKind};
    use crate::rule::ActivationRule;

    /// Enabled, open-ended trace rule that started a minute ago.
    pub fn rule(pattern: &str, tenant: &str) -> ActivationRule {
        let now = Utc::now();
        ActivationRule {
            id: Uuid::new_v4(),
            telemetry_kind: TelemetryKind::Trace,
            object_pattern: crate::pattern::normalize(pattern),
            tenant_id: crate::rule::normalize_tenant(tenant),
            enabled: true,
            active_from: now - Duration::minutes(1),
            active_to: None,
            sampling_rate: 1.0,
            min_log_level: None,
            revision: 1,
            created_by: "alice".into(),
            created_at: now,
            updated_by: None,
            updated_at: None,
        }
    }

    pub fn log_rule(pattern: &str, tenant: &str, level: LogLevel) -> ActivationRule {
        ActivationRule {
            telemetry_kind: TelemetryKind::Log,
            min_log_level: Some(level),
            ..rule(pattern, tenant)
        }
    }

    pub fn audit_record(
        operation: AuditOperation,
        old_enabled: Option<bool>,
        new_enabled: Option<bool>,
    ) -> AuditRecord {
        let snapshot = |enabled: bool| RuleSnapshot {
            enabled,
            ..RuleSnapshot::from(&rule("ORDER_PKG.*", "T1"))
        };
        AuditRecord {
            id: Uuid::new_v4(),
            operation,
            telemetry_kind: TelemetryKind::Trace,
            object_pattern: "ORDER_PKG.*".into(),
            tenant_id: "T1".into(),
            before: old_enabled.map(snapshot),
            after: new_enabled.map(snapshot),
            actor: "alice".into(),
            session: SessionContext::default(),
            changed_at: Utc::now(),
        }
    }
}
