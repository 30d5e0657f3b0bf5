use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditRecord;
use crate::error::ActivationError;
use crate::kind::TelemetryKind;
use crate::rule::{normalize_tenant, ActivationRule};
use crate::store::ActivationStore;
use crate::validation::hours_before;

/// Rule counts for one (tenant, kind) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationSummary {
    pub tenant_id: String,
    pub telemetry_kind: TelemetryKind,
    pub total_rules: usize,
    pub enabled_rules: usize,
    /// Enabled and inside their window right now.
    pub active_rules: usize,
    pub avg_sampling_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveConfiguration {
    pub specificity: i64,
    #[serde(flatten)]
    pub rule: ActivationRule,
}

/// Read-only views; none of them touch the resolver cache.
impl ActivationStore {
    pub async fn activation_summary(
        &self,
        tenant: Option<&str>,
    ) -> Result<Vec<ActivationSummary>, ActivationError> {
        let tenant = tenant.map(normalize_tenant);
        let now = Utc::now();
        let mut groups: BTreeMap<(String, TelemetryKind), Vec<ActivationRule>> = BTreeMap::new();
        for rule in self.repository.load_all().await? {
            if tenant.as_ref().map_or(true, |tenant| &rule.tenant_id == tenant) {
                groups
                    .entry((rule.tenant_id.clone(), rule.telemetry_kind))
                    .or_default()
                    .push(rule);
            }
        }

        Ok(groups
            .into_iter()
            .map(|((tenant_id, telemetry_kind), rules)| {
                let total_rules = rules.len();
                let rate_sum: f64 = rules.iter().map(|rule| rule.sampling_rate).sum();
                ActivationSummary {
                    tenant_id,
                    telemetry_kind,
                    total_rules,
                    enabled_rules: rules.iter().filter(|rule| rule.enabled).count(),
                    active_rules: rules.iter().filter(|rule| rule.is_live_at(now)).count(),
                    avg_sampling_rate: rate_sum / total_rules as f64,
                }
            })
            .collect())
    }

    /// Rules currently in force, most specific first.
    pub async fn active_configurations(
        &self,
        tenant: Option<&str>,
        kind: Option<TelemetryKind>,
    ) -> Result<Vec<ActiveConfiguration>, ActivationError> {
        let tenant = tenant.map(normalize_tenant);
        let now = Utc::now();
        let mut active: Vec<ActiveConfiguration> = self
            .repository
            .load_all()
            .await?
            .into_iter()
            .filter(|rule| rule.is_live_at(now))
            .filter(|rule| tenant.as_ref().map_or(true, |tenant| &rule.tenant_id == tenant))
            .filter(|rule| kind.map_or(true, |kind| rule.telemetry_kind == kind))
            .map(|rule| ActiveConfiguration {
                specificity: rule.specificity(),
                rule,
            })
            .collect();
        active.sort_by(|a, b| {
            b.specificity
                .cmp(&a.specificity)
                .then_with(|| a.rule.object_pattern.cmp(&b.rule.object_pattern))
        });
        Ok(active)
    }

    /// Audit records from the last `hours`, newest first.
    pub async fn recent_changes(
        &self,
        hours: u32,
        tenant: Option<&str>,
    ) -> Result<Vec<AuditRecord>, ActivationError> {
        self.recent_changes_since(hours_before(Utc::now(), hours)?, tenant)
            .await
    }

    pub async fn recent_changes_since(
        &self,
        cutoff: DateTime<Utc>,
        tenant: Option<&str>,
    ) -> Result<Vec<AuditRecord>, ActivationError> {
        let tenant = tenant.map(normalize_tenant);
        self.audit.repository().since(cutoff, tenant.as_deref()).await
    }
}
