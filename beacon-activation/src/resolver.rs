use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::cache::CachedRule;
use crate::error::ActivationError;
use crate::kind::TelemetryKind;
use crate::pattern;
use crate::rule::{normalize_tenant, GLOBAL_TENANT};

/// Supplies candidate rules to the resolver.
pub trait RuleSource: Send + Sync {
    /// Enabled rules for (`kind`, `tenant`) whose window contains `now`,
    /// ordered by decreasing pattern length.
    fn candidates(
        &self,
        kind: TelemetryKind,
        tenant: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Arc<CachedRule>>, ActivationError>;
}

impl<S: RuleSource + ?Sized> RuleSource for Arc<S> {
    fn candidates(
        &self,
        kind: TelemetryKind,
        tenant: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Arc<CachedRule>>, ActivationError> {
        (**self).candidates(kind, tenant, now)
    }
}

/// Picks the single rule that governs an object for a tenant.
///
/// A tenant's own matching rule always wins over a global (`ALL`) rule, even
/// a more specific one; the global set is consulted only when the tenant has
/// no match at all.
#[derive(Debug, Clone)]
pub struct Resolver<S> {
    source: S,
}

impl<S: RuleSource> Resolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn resolve(
        &self,
        object_name: &str,
        kind: TelemetryKind,
        tenant: &str,
    ) -> Result<Option<Arc<CachedRule>>, ActivationError> {
        self.resolve_at(object_name, kind, tenant, Utc::now())
    }

    pub fn resolve_at(
        &self,
        object_name: &str,
        kind: TelemetryKind,
        tenant: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<CachedRule>>, ActivationError> {
        let object = pattern::normalize(object_name);
        let tenant = normalize_tenant(tenant);

        if let Some(found) = self.best_match(&object, kind, &tenant, now)? {
            trace!(object = %object, tenant = %tenant, pattern = %found.rule.object_pattern, "resolved tenant rule");
            return Ok(Some(found));
        }
        if tenant == GLOBAL_TENANT {
            return Ok(None);
        }

        let global = self.best_match(&object, kind, GLOBAL_TENANT, now)?;
        if let Some(found) = &global {
            trace!(object = %object, tenant = %tenant, pattern = %found.rule.object_pattern, "resolved global rule");
        }
        Ok(global)
    }

    fn best_match(
        &self,
        object: &str,
        kind: TelemetryKind,
        tenant: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<CachedRule>>, ActivationError> {
        let mut best: Option<Arc<CachedRule>> = None;
        for candidate in self.source.candidates(kind, tenant, now)? {
            if !candidate.pattern.matches_normalized(object) {
                continue;
            }
            // Strictly greater: the first candidate seen keeps a tie.
            let better = best
                .as_ref()
                .map_or(true, |current| candidate.rank() > current.rank());
            if better {
                best = Some(candidate);
            }
        }
        Ok(best)
    }
}
