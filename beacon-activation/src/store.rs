use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::audit::{AuditTrail, MemoryAuditRepository};
use crate::cache::RuleCache;
use crate::context::AdminContext;
use crate::decision::ActivationEngine;
use crate::error::ActivationError;
use crate::kind::TelemetryKind;
use crate::repository::{MemoryRuleRepository, RuleChange, RuleRepository, WritePermit};
use crate::rule::{normalize_tenant, ActivationRule, RuleKey};
use crate::sink::TracingAuditSink;
use crate::validation::{validate, ActivationWindow, EnableRequest};

pub(crate) const DEFAULT_BATCH_SIZE: usize = 500;

/// One pattern that a bulk call could not activate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub pattern: String,
    pub reason: String,
}

/// Per-item result of a bulk activation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<BulkFailure>,
}

impl BulkOutcome {
    fn record_failure(&mut self, pattern: &str, err: &ActivationError) {
        self.failed += 1;
        self.failures.push(BulkFailure {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        });
    }
}

/// Administrative entry point over the rule repository.
///
/// Every write path ends in [`ActivationStore::commit`], which refreshes the
/// resolver cache and hands the change to the audit trail. Repositories only
/// accept writes carrying a [`WritePermit`], which nothing outside this crate
/// can create.
#[derive(Clone)]
pub struct ActivationStore {
    pub(crate) repository: Arc<dyn RuleRepository>,
    pub(crate) cache: RuleCache,
    pub(crate) audit: AuditTrail,
    pub(crate) batch_size: usize,
}

impl ActivationStore {
    pub fn new(repository: Arc<dyn RuleRepository>, audit: AuditTrail) -> Self {
        Self {
            repository,
            cache: RuleCache::new(),
            audit,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Store backed by in-process repositories, auditing to the tracing sink.
    pub fn in_memory() -> Self {
        let audit = AuditTrail::new(
            Arc::new(MemoryAuditRepository::new()),
            Arc::new(TracingAuditSink),
        );
        Self::new(Arc::new(MemoryRuleRepository::new()), audit)
    }

    /// Caps the rows touched by each maintenance batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Reconciles the resolver cache with every persisted rule.
    pub async fn hydrate(&self) -> Result<usize, ActivationError> {
        let loaded_at = Utc::now();
        let rules = self.repository.load_all().await?;
        let total = rules.len();
        self.cache.refresh(rules, loaded_at);
        debug!(total, cached = self.cache.len(), "hydrated activation cache");
        Ok(total)
    }

    /// Re-runs [`ActivationStore::hydrate`] every `every`, so rules written by
    /// other processes sharing the repository reach this cache.
    pub fn spawn_refresh(&self, every: std::time::Duration) -> JoinHandle<()> {
        let store = self.clone();
        let every = every.max(std::time::Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = store.hydrate().await {
                    warn!(%err, "activation cache refresh failed");
                }
            }
        })
    }

    /// Decision engine reading this store's cache.
    pub fn engine(&self) -> ActivationEngine<RuleCache> {
        ActivationEngine::new(self.cache.clone())
    }

    pub fn cache(&self) -> &RuleCache {
        &self.cache
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Activates with no end time (or the request's own window).
    pub async fn enable(
        &self,
        ctx: &AdminContext,
        request: EnableRequest,
    ) -> Result<ActivationRule, ActivationError> {
        let now = Utc::now();
        let activation = validate(&request, now)?;
        let change = self
            .repository
            .upsert(&WritePermit::new(), &activation, &ctx.actor, now)
            .await?;
        let rule = change
            .after
            .clone()
            .ok_or_else(|| ActivationError::Storage("upsert returned no row".into()))?;
        self.commit(ctx, change).await;
        info!(
            key = %rule.key(),
            sampling_rate = rule.sampling_rate,
            actor = %ctx.actor,
            "activation enabled"
        );
        Ok(rule)
    }

    /// Activates for a relative interval starting at the request's start time.
    pub async fn enable_for(
        &self,
        ctx: &AdminContext,
        request: EnableRequest,
        duration: Duration,
    ) -> Result<ActivationRule, ActivationError> {
        self.enable(ctx, EnableRequest {
            window: ActivationWindow::For(duration),
            ..request
        })
        .await
    }

    /// Activates between the request's start time and `end`.
    pub async fn enable_until(
        &self,
        ctx: &AdminContext,
        request: EnableRequest,
        end: DateTime<Utc>,
    ) -> Result<ActivationRule, ActivationError> {
        self.enable(ctx, EnableRequest {
            window: ActivationWindow::Until(end),
            ..request
        })
        .await
    }

    /// Switches one rule off without deleting it; returns its current state.
    pub async fn disable(
        &self,
        ctx: &AdminContext,
        object_pattern: &str,
        kind: TelemetryKind,
        tenant: &str,
    ) -> Result<ActivationRule, ActivationError> {
        let key = RuleKey::new(kind, object_pattern, tenant);
        let change = self
            .repository
            .disable(&WritePermit::new(), &key, &ctx.actor, Utc::now())
            .await?;
        match change {
            Some(change) => {
                let rule = change.after.clone();
                self.commit(ctx, change).await;
                info!(key = %key, actor = %ctx.actor, "activation disabled");
                rule.ok_or_else(|| ActivationError::NotFound(key.to_string()))
            }
            None => self
                .repository
                .get(&key)
                .await?
                .ok_or_else(|| ActivationError::NotFound(key.to_string())),
        }
    }

    /// Activates many patterns with shared settings, isolating each item.
    pub async fn enable_bulk<P: AsRef<str>>(
        &self,
        ctx: &AdminContext,
        patterns: &[P],
        kind: TelemetryKind,
        tenant: &str,
        sampling_rate: f64,
        duration: Option<Duration>,
    ) -> BulkOutcome {
        let requests: Vec<EnableRequest> = patterns
            .iter()
            .map(|pattern| {
                let request = EnableRequest::new(pattern.as_ref(), kind, tenant).sampling_rate(sampling_rate);
                match duration {
                    Some(duration) => request.lasting(duration),
                    None => request,
                }
            })
            .collect();
        self.enable_each(ctx, requests).await
    }

    /// Applies each request through [`ActivationStore::enable`], counting failures instead of stopping.
    pub async fn enable_each(
        &self,
        ctx: &AdminContext,
        requests: Vec<EnableRequest>,
    ) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for request in requests {
            let pattern = request.object_pattern.clone();
            match self.enable(ctx, request).await {
                Ok(_) => outcome.succeeded += 1,
                Err(err) => {
                    warn!(pattern = %pattern, %err, "bulk activation item failed");
                    outcome.record_failure(&pattern, &err);
                }
            }
        }
        info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            actor = %ctx.actor,
            "bulk activation finished"
        );
        outcome
    }

    /// Emergency brake: disables every enabled rule of a tenant, optionally of one kind.
    pub async fn disable_all(
        &self,
        ctx: &AdminContext,
        tenant: &str,
        kind: Option<TelemetryKind>,
    ) -> Result<usize, ActivationError> {
        let tenant = normalize_tenant(tenant);
        let changes = self
            .repository
            .disable_matching(&WritePermit::new(), &tenant, kind, &ctx.actor, Utc::now())
            .await?;
        let disabled = changes.len();
        for change in changes {
            self.commit(ctx, change).await;
        }
        warn!(tenant = %tenant, kind = ?kind, disabled, actor = %ctx.actor, "emergency disable-all");
        Ok(disabled)
    }

    /// Looks up one rule by its triple.
    pub async fn get(
        &self,
        object_pattern: &str,
        kind: TelemetryKind,
        tenant: &str,
    ) -> Result<Option<ActivationRule>, ActivationError> {
        self.repository.get(&RuleKey::new(kind, object_pattern, tenant)).await
    }

    pub(crate) async fn commit(&self, ctx: &AdminContext, change: RuleChange) {
        self.cache.apply(&change);
        self.audit.capture(&change, ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditOperation, AuditRepository, MemoryAuditRepository};
    use crate::kind::LogLevel;
    use crate::sink::ChannelAuditSink;

    fn store() -> (ActivationStore, MemoryAuditRepository) {
        let audit_repo = MemoryAuditRepository::new();
        let (sink, _receiver) = ChannelAuditSink::new(16);
        let audit = AuditTrail::new(Arc::new(audit_repo.clone()), Arc::new(sink));
        (
            ActivationStore::new(Arc::new(MemoryRuleRepository::new()), audit),
            audit_repo,
        )
    }

    fn alice() -> AdminContext {
        AdminContext::new("alice").with_session("session-1")
    }

    #[tokio::test]
    async fn enable_is_an_audited_upsert() {
        let (store, audit) = store();
        let ctx = alice();
        store
            .enable(&ctx, EnableRequest::new("order_pkg.*", TelemetryKind::Trace, "T1"))
            .await
            .unwrap();
        let rule = store
            .enable(
                &ctx,
                EnableRequest::new("ORDER_PKG.*", TelemetryKind::Trace, "T1").sampling_rate(0.3),
            )
            .await
            .unwrap();

        assert_eq!(rule.sampling_rate, 0.3);
        assert_eq!(store.repository.load_all().await.unwrap().len(), 1);
        let history = audit.history(&rule.key()).await.unwrap();
        let operations: Vec<_> = history.iter().map(|record| record.operation).collect();
        assert_eq!(operations, vec![AuditOperation::Insert, AuditOperation::Update]);
        assert_eq!(history[1].before.as_ref().unwrap().sampling_rate, 1.0);
        assert_eq!(history[1].after.as_ref().unwrap().sampling_rate, 0.3);
    }

    #[tokio::test]
    async fn validation_errors_reach_the_caller_and_leave_no_trace() {
        let (store, audit) = store();
        let err = store
            .enable(
                &alice(),
                EnableRequest::new("ORDER_PKG.*", TelemetryKind::Trace, "T1").sampling_rate(2.0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::SamplingRateOutOfRange(_)));
        assert!(audit.is_empty());
        assert!(store.cache().is_empty());
    }

    #[tokio::test]
    async fn window_helpers_set_the_end() {
        let (store, _) = store();
        let start = Utc::now();
        let request = EnableRequest::new("A.*", TelemetryKind::Log, "T1")
            .starting_at(start)
            .min_log_level(LogLevel::Warn);
        let rule = store
            .enable_for(&alice(), request.clone(), Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(rule.active_to, Some(start + Duration::minutes(30)));
        assert_eq!(rule.min_log_level, Some(LogLevel::Warn));

        let end = start + Duration::hours(2);
        let rule = store.enable_until(&alice(), request.clone(), end).await.unwrap();
        assert_eq!(rule.active_to, Some(end));

        let err = store.enable_until(&alice(), request, start).await.unwrap_err();
        assert!(matches!(err, ActivationError::InvertedWindow));
    }

    #[tokio::test]
    async fn disable_keeps_history_and_is_idempotent() {
        let (store, audit) = store();
        let ctx = alice();
        store
            .enable(&ctx, EnableRequest::new("ORDER_PKG.CREATE", TelemetryKind::Trace, "T1"))
            .await
            .unwrap();
        let disabled = store
            .disable(&ctx, "ORDER_PKG.CREATE", TelemetryKind::Trace, "T1")
            .await
            .unwrap();
        assert!(!disabled.enabled);
        let again = store
            .disable(&ctx, "ORDER_PKG.CREATE", TelemetryKind::Trace, "T1")
            .await
            .unwrap();
        assert!(!again.enabled);

        assert_eq!(audit.history(&disabled.key()).await.unwrap().len(), 2);
        assert!(store.get("ORDER_PKG.CREATE", TelemetryKind::Trace, "T1").await.unwrap().is_some());
        assert!(matches!(
            store.disable(&ctx, "MISSING", TelemetryKind::Trace, "T1").await,
            Err(ActivationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bulk_counts_invalid_patterns() {
        let (store, _) = store();
        let outcome = store
            .enable_bulk(
                &alice(),
                &["A.*", "B-C", "D.E", "", "F_G.*"],
                TelemetryKind::Metric,
                "T1",
                0.5,
                Some(Duration::hours(1)),
            )
            .await;
        assert_eq!(outcome.succeeded, 3);
        assert_eq!(outcome.failed, 2);
        let failed: Vec<_> = outcome.failures.iter().map(|f| f.pattern.as_str()).collect();
        assert_eq!(failed, vec!["B-C", ""]);
        assert_eq!(store.cache().len(), 3);
    }

    #[tokio::test]
    async fn disable_all_is_scoped_to_tenant_and_kind() {
        let (store, _) = store();
        let ctx = alice();
        for (pattern, kind, tenant) in [
            ("A", TelemetryKind::Trace, "T1"),
            ("B", TelemetryKind::Log, "T1"),
            ("C", TelemetryKind::Trace, "T2"),
        ] {
            store.enable(&ctx, EnableRequest::new(pattern, kind, tenant)).await.unwrap();
        }

        assert_eq!(store.disable_all(&ctx, "T1", Some(TelemetryKind::Trace)).await.unwrap(), 1);
        assert_eq!(store.disable_all(&ctx, "T1", None).await.unwrap(), 1);
        assert_eq!(store.disable_all(&ctx, "T1", None).await.unwrap(), 0);
        assert_eq!(store.cache().len(), 1);
    }
}
