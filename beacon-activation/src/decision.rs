use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::kind::{LogLevel, TelemetryKind};
use crate::resolver::{Resolver, RuleSource};

/// Outcome of evaluating one instrumentation call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub emit: bool,
    /// Sampling rate of the governing rule; `0.0` when none applies.
    pub sampling_rate: f64,
    pub min_log_level: Option<LogLevel>,
    pub matched_pattern: Option<String>,
    pub matched_tenant: Option<String>,
}

impl Decision {
    fn closed() -> Self {
        Self {
            emit: false,
            sampling_rate: 0.0,
            min_log_level: None,
            matched_pattern: None,
            matched_tenant: None,
        }
    }
}

/// Hot-path entry point answering "should telemetry be produced here, now?".
///
/// Every method is fail-closed: a missing rule or an internal fault yields
/// "do not emit", never an error.
#[derive(Debug, Clone)]
pub struct ActivationEngine<S> {
    resolver: Resolver<S>,
}

impl<S: RuleSource> ActivationEngine<S> {
    pub fn new(source: S) -> Self {
        Self {
            resolver: Resolver::new(source),
        }
    }

    pub fn resolver(&self) -> &Resolver<S> {
        &self.resolver
    }

    pub fn should_emit(
        &self,
        object_name: &str,
        kind: TelemetryKind,
        tenant: &str,
        log_level: Option<LogLevel>,
    ) -> bool {
        self.decide(object_name, kind, tenant, log_level).emit
    }

    pub fn is_trace_enabled(&self, object_name: &str, tenant: &str) -> bool {
        self.should_emit(object_name, TelemetryKind::Trace, tenant, None)
    }

    pub fn is_log_enabled(&self, object_name: &str, tenant: &str, level: LogLevel) -> bool {
        self.should_emit(object_name, TelemetryKind::Log, tenant, Some(level))
    }

    pub fn is_metric_enabled(&self, object_name: &str, tenant: &str) -> bool {
        self.should_emit(object_name, TelemetryKind::Metric, tenant, None)
    }

    /// Sampling rate of the governing rule, or `0.0` if none applies.
    pub fn get_sampling_rate(&self, object_name: &str, kind: TelemetryKind, tenant: &str) -> f64 {
        match self.resolver.resolve(object_name, kind, tenant) {
            Ok(Some(cached)) => cached.rule.sampling_rate,
            Ok(None) => 0.0,
            Err(err) => {
                warn!(object = object_name, %kind, tenant, %err, "sampling rate lookup failed");
                0.0
            }
        }
    }

    pub fn decide(
        &self,
        object_name: &str,
        kind: TelemetryKind,
        tenant: &str,
        log_level: Option<LogLevel>,
    ) -> Decision {
        self.decide_with(object_name, kind, tenant, log_level, Utc::now(), &mut rand::thread_rng())
    }

    /// Evaluates at an explicit instant with a caller-supplied random source.
    pub fn decide_with<R: Rng + ?Sized>(
        &self,
        object_name: &str,
        kind: TelemetryKind,
        tenant: &str,
        log_level: Option<LogLevel>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Decision {
        let cached = match self.resolver.resolve_at(object_name, kind, tenant, now) {
            Ok(Some(cached)) => cached,
            Ok(None) => return Decision::closed(),
            Err(err) => {
                warn!(object = object_name, %kind, tenant, %err, "activation lookup failed; not emitting");
                return Decision::closed();
            }
        };
        let rule = &cached.rule;

        let mut decision = Decision {
            emit: false,
            sampling_rate: rule.sampling_rate,
            min_log_level: rule.min_log_level,
            matched_pattern: Some(rule.object_pattern.clone()),
            matched_tenant: Some(rule.tenant_id.clone()),
        };

        if kind == TelemetryKind::Log {
            if let Some(level) = log_level {
                if !level.satisfies(rule.log_threshold()) {
                    return decision;
                }
            }
        }

        decision.emit = sample(rule.sampling_rate, rng);
        decision
    }
}

/// Rates at or beyond the bounds are deterministic; anything between draws once.
pub fn sample<R: Rng + ?Sized>(rate: f64, rng: &mut R) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 || rate.is_nan() {
        return false;
    }
    rng.gen::<f64>() <= rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::{CachedRule, RuleCache};
    use crate::error::ActivationError;
    use crate::testing::{log_rule, rule};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn engine(rules: Vec<crate::rule::ActivationRule>) -> ActivationEngine<RuleCache> {
        let cache = RuleCache::new();
        cache.replace_all(rules);
        ActivationEngine::new(cache)
    }

    struct FailingSource;

    impl RuleSource for FailingSource {
        fn candidates(
            &self,
            _kind: TelemetryKind,
            _tenant: &str,
            _now: DateTime<Utc>,
        ) -> Result<Vec<Arc<CachedRule>>, ActivationError> {
            Err(ActivationError::Storage("backend unavailable".into()))
        }
    }

    #[test]
    fn no_rule_means_no_emit() {
        let engine = engine(vec![]);
        assert!(!engine.should_emit("ANY.THING", TelemetryKind::Trace, "T1", None));
        assert!(!engine.is_metric_enabled("ANY.THING", "T1"));
        assert_eq!(engine.get_sampling_rate("ANY.THING", TelemetryKind::Trace, "T1"), 0.0);
    }

    #[test]
    fn faults_fail_closed() {
        let engine = ActivationEngine::new(FailingSource);
        assert!(!engine.is_trace_enabled("ORDER_PKG.CREATE", "T1"));
        assert!(!engine.is_log_enabled("ORDER_PKG.CREATE", "T1", LogLevel::Fatal));
        assert_eq!(engine.get_sampling_rate("ORDER_PKG.CREATE", TelemetryKind::Trace, "T1"), 0.0);
    }

    #[test]
    fn boundary_rates_are_deterministic() {
        let mut full = rule("ORDER_PKG.*", "T1");
        full.sampling_rate = 1.0;
        let mut none = rule("ORDER_PKG.CREATE", "T1");
        none.sampling_rate = 0.0;
        let engine = engine(vec![full, none]);
        for _ in 0..200 {
            assert!(engine.is_trace_enabled("ORDER_PKG.UPDATE", "T1"));
            assert!(!engine.is_trace_enabled("ORDER_PKG.CREATE", "T1"));
        }
    }

    #[test]
    fn fractional_rate_samples_roughly_proportionally() {
        let mut half = rule("*", "T1");
        half.sampling_rate = 0.5;
        let engine = engine(vec![half]);
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc::now();
        let emitted = (0..2000)
            .filter(|_| {
                engine
                    .decide_with("X", TelemetryKind::Trace, "T1", None, now, &mut rng)
                    .emit
            })
            .count();
        assert!((800..1200).contains(&emitted), "emitted {emitted} of 2000");
    }

    #[test]
    fn log_threshold_filters_low_severity() {
        let engine = engine(vec![log_rule("*", "ALL", LogLevel::Info)]);
        assert!(!engine.is_log_enabled("ORDER_PKG.CREATE", "T9", LogLevel::Debug));
        assert!(engine.is_log_enabled("ORDER_PKG.CREATE", "T9", LogLevel::Warn));
        assert!(engine.is_log_enabled("ORDER_PKG.CREATE", "T9", LogLevel::Info));
        // Without a supplied level only sampling applies.
        assert!(engine.should_emit("ORDER_PKG.CREATE", TelemetryKind::Log, "T9", None));
    }

    #[test]
    fn decision_reports_the_governing_rule() {
        let mut specific = rule("ORDER_PKG.CREATE", "T1");
        specific.sampling_rate = 0.0;
        let engine = engine(vec![rule("ORDER_PKG.*", "T1"), specific]);
        let decision = engine.decide("ORDER_PKG.CREATE", TelemetryKind::Trace, "T1", None);
        assert!(!decision.emit);
        assert_eq!(decision.matched_pattern.as_deref(), Some("ORDER_PKG.CREATE"));
        assert_eq!(decision.matched_tenant.as_deref(), Some("T1"));
        assert_eq!(decision.sampling_rate, 0.0);
    }
}
