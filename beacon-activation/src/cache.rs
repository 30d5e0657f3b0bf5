use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::ActivationError;
use crate::kind::TelemetryKind;
use crate::pattern::ObjectPattern;
use crate::repository::RuleChange;
use crate::resolver::RuleSource;
use crate::rule::{ActivationRule, RuleKey};

/// A rule together with its compiled pattern.
#[derive(Debug, Clone)]
pub struct CachedRule {
    pub rule: ActivationRule,
    pub pattern: ObjectPattern,
}

impl CachedRule {
    pub fn new(rule: ActivationRule) -> Self {
        let pattern = ObjectPattern::new(&rule.object_pattern);
        Self { rule, pattern }
    }

    /// Ordering key among matching candidates: exact patterns first, then specificity.
    pub fn rank(&self) -> (bool, i64) {
        (self.pattern.is_exact(), self.pattern.specificity())
    }

    /// Position within a partition: longer patterns first, then the older rule.
    fn order_key(&self) -> (Reverse<usize>, DateTime<Utc>, Uuid) {
        (
            Reverse(self.rule.object_pattern.chars().count()),
            self.rule.created_at,
            self.rule.id,
        )
    }
}

type Partition = Vec<Arc<CachedRule>>;

/// Read model the resolver queries on the hot path.
///
/// Holds enabled rules only, partitioned by (kind, tenant) and ordered by
/// decreasing pattern length, then by creation time and id. Readers share
/// the lock; writers hold it only to splice a single entry or swap in a
/// refreshed snapshot.
#[derive(Debug, Clone, Default)]
pub struct RuleCache {
    partitions: Arc<RwLock<HashMap<(TelemetryKind, String), Partition>>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole cache with the enabled rules of `rules`.
    pub fn replace_all(&self, rules: impl IntoIterator<Item = ActivationRule>) {
        let entries = rules
            .into_iter()
            .filter(|rule| rule.enabled)
            .map(|rule| Arc::new(CachedRule::new(rule)));
        *self.partitions.write() = build_partitions(entries);
    }

    /// Reconciles the cache with a repository snapshot read at `loaded_at`.
    ///
    /// A cached entry survives when it carries a higher revision than the
    /// snapshot, or when it is missing from the snapshot but was created after
    /// `loaded_at`. Entries whose revision did not change keep their compiled
    /// pattern.
    pub fn refresh(&self, rules: Vec<ActivationRule>, loaded_at: DateTime<Utc>) {
        let mut partitions = self.partitions.write();
        let mut cached: HashMap<RuleKey, Arc<CachedRule>> = partitions
            .values()
            .flatten()
            .map(|entry| (entry.rule.key(), entry.clone()))
            .collect();

        let mut entries = Vec::with_capacity(rules.len());
        for rule in rules {
            match cached.remove(&rule.key()) {
                Some(entry) if entry.rule.revision > rule.revision => entries.push(entry),
                Some(entry) if entry.rule.revision == rule.revision && rule.enabled => entries.push(entry),
                _ if rule.enabled => entries.push(Arc::new(CachedRule::new(rule))),
                _ => {}
            }
        }
        entries.extend(
            cached
                .into_values()
                .filter(|entry| entry.rule.created_at > loaded_at),
        );

        *partitions = build_partitions(entries);
    }

    /// Folds a committed change into the cache.
    pub fn apply(&self, change: &RuleChange) {
        match (&change.before, &change.after) {
            (_, Some(after)) if after.enabled => self.upsert(after.clone()),
            (_, Some(after)) => self.remove(&after.key(), after.revision),
            (Some(before), None) => self.remove(&before.key(), before.revision),
            (None, None) => {}
        }
    }

    /// Number of cached (enabled) rules.
    pub fn len(&self) -> usize {
        self.partitions.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn upsert(&self, rule: ActivationRule) {
        let mut partitions = self.partitions.write();
        let partition = partitions
            .entry((rule.telemetry_kind, rule.tenant_id.clone()))
            .or_default();

        if let Some(slot) = partition
            .iter_mut()
            .find(|cached| cached.rule.object_pattern == rule.object_pattern)
        {
            if slot.rule.revision <= rule.revision {
                *slot = Arc::new(CachedRule::new(rule));
            }
            return;
        }
        insert_ordered(partition, Arc::new(CachedRule::new(rule)));
    }

    fn remove(&self, key: &RuleKey, revision: i64) {
        let mut partitions = self.partitions.write();
        let partition_key = (key.telemetry_kind, key.tenant_id.clone());
        if let Some(partition) = partitions.get_mut(&partition_key) {
            partition.retain(|cached| {
                cached.rule.object_pattern != key.object_pattern || cached.rule.revision > revision
            });
            if partition.is_empty() {
                partitions.remove(&partition_key);
            }
        }
    }
}

fn build_partitions(
    entries: impl IntoIterator<Item = Arc<CachedRule>>,
) -> HashMap<(TelemetryKind, String), Partition> {
    let mut partitions: HashMap<(TelemetryKind, String), Partition> = HashMap::new();
    for entry in entries {
        partitions
            .entry((entry.rule.telemetry_kind, entry.rule.tenant_id.clone()))
            .or_default()
            .push(entry);
    }
    for partition in partitions.values_mut() {
        partition.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    }
    partitions
}

fn insert_ordered(partition: &mut Partition, entry: Arc<CachedRule>) {
    let key = entry.order_key();
    let index = partition.partition_point(|existing| existing.order_key() < key);
    partition.insert(index, entry);
}

impl RuleSource for RuleCache {
    fn candidates(
        &self,
        kind: TelemetryKind,
        tenant: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Arc<CachedRule>>, ActivationError> {
        let partitions = self.partitions.read();
        let candidates = partitions
            .get(&(kind, tenant.to_string()))
            .map(|partition| {
                partition
                    .iter()
                    .filter(|cached| cached.rule.is_live_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditOperation;
    use crate::testing::rule;
    use chrono::Duration;

    fn created(pattern: &str, seconds_ago: i64) -> ActivationRule {
        let mut rule = rule(pattern, "T1");
        rule.created_at = rule.created_at - Duration::seconds(seconds_ago);
        rule
    }

    fn patterns(cache: &RuleCache) -> Vec<String> {
        cache
            .candidates(TelemetryKind::Trace, "T1", Utc::now())
            .unwrap()
            .iter()
            .map(|cached| cached.rule.object_pattern.clone())
            .collect()
    }

    #[test]
    fn candidates_are_ordered_by_pattern_length() {
        let cache = RuleCache::new();
        cache.replace_all(vec![
            created("B.*", 10),
            created("ORDER_PKG.CREATE", 30),
            created("A.*", 40),
            created("ORDER_PKG.*", 20),
        ]);
        assert_eq!(patterns(&cache), vec!["ORDER_PKG.CREATE", "ORDER_PKG.*", "A.*", "B.*"]);
    }

    #[test]
    fn reenabled_rule_returns_to_its_creation_slot() {
        let cache = RuleCache::new();
        let first = created("A.*", 40);
        cache.replace_all(vec![first.clone(), created("B.*", 10)]);

        let mut disabled = first.clone();
        disabled.enabled = false;
        disabled.revision = 2;
        cache.apply(&RuleChange {
            operation: AuditOperation::Update,
            before: Some(first.clone()),
            after: Some(disabled.clone()),
        });
        assert_eq!(patterns(&cache), vec!["B.*"]);

        let mut reenabled = disabled.clone();
        reenabled.enabled = true;
        reenabled.revision = 3;
        cache.apply(&RuleChange {
            operation: AuditOperation::Update,
            before: Some(disabled),
            after: Some(reenabled.clone()),
        });
        assert_eq!(patterns(&cache), vec!["A.*", "B.*"]);

        let reloaded = RuleCache::new();
        reloaded.replace_all(vec![created("B.*", 10), reenabled]);
        assert_eq!(patterns(&reloaded), patterns(&cache));
    }

    #[test]
    fn refresh_prefers_newer_revisions_and_keeps_fresh_local_rules() {
        let cache = RuleCache::new();
        let loaded_at = Utc::now();

        let mut local = created("A.*", 0);
        local.revision = 4;
        local.sampling_rate = 0.5;
        let mut fresh = rule("C.*", "T1");
        fresh.created_at = loaded_at + Duration::seconds(1);
        let gone = created("D.*", 60);
        cache.replace_all(vec![local.clone(), fresh, gone]);

        let mut stored_local = local.clone();
        stored_local.revision = 3;
        stored_local.sampling_rate = 1.0;
        let mut remote_disabled = created("E.*", 60);
        remote_disabled.enabled = false;
        cache.refresh(vec![stored_local, created("B.*", 30), remote_disabled], loaded_at);

        let mut seen = patterns(&cache);
        seen.sort();
        assert_eq!(seen, vec!["A.*", "B.*", "C.*"]);
        let candidates = cache.candidates(TelemetryKind::Trace, "T1", Utc::now()).unwrap();
        let a = candidates.iter().find(|c| c.rule.object_pattern == "A.*").unwrap();
        assert_eq!(a.rule.sampling_rate, 0.5);
    }

    #[test]
    fn refresh_drops_rules_disabled_elsewhere() {
        let cache = RuleCache::new();
        let enabled = created("A.*", 60);
        cache.replace_all(vec![enabled.clone()]);

        let mut disabled = enabled;
        disabled.enabled = false;
        disabled.revision = 2;
        cache.refresh(vec![disabled], Utc::now());
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_changes_evict_and_stale_revisions_are_ignored() {
        let cache = RuleCache::new();
        let mut current = rule("A.*", "T1");
        current.revision = 3;
        cache.replace_all(vec![current.clone()]);

        let mut stale = current.clone();
        stale.revision = 2;
        stale.sampling_rate = 0.25;
        cache.apply(&RuleChange {
            operation: AuditOperation::Update,
            before: None,
            after: Some(stale),
        });
        let cached = cache.candidates(TelemetryKind::Trace, "T1", Utc::now()).unwrap();
        assert_eq!(cached[0].rule.sampling_rate, 1.0);

        let mut disabled = current.clone();
        disabled.enabled = false;
        disabled.revision = 4;
        cache.apply(&RuleChange {
            operation: AuditOperation::Update,
            before: Some(current),
            after: Some(disabled),
        });
        assert!(cache.is_empty());
    }
}
