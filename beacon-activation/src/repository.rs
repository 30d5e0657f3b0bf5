use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::audit::AuditOperation;
use crate::error::ActivationError;
use crate::kind::TelemetryKind;
use crate::rule::{ActivationRule, RuleKey};
use crate::validation::ValidatedActivation;

/// A committed mutation of one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleChange {
    pub operation: AuditOperation,
    pub before: Option<ActivationRule>,
    pub after: Option<ActivationRule>,
}

impl RuleChange {
    fn update(before: ActivationRule, after: ActivationRule) -> Self {
        Self {
            operation: AuditOperation::Update,
            before: Some(before),
            after: Some(after),
        }
    }
}

/// Proof that a write was issued by the audited store.
///
/// Only the store can mint one, so every mutation path goes through change
/// capture even though repositories are public types.
#[derive(Debug)]
pub struct WritePermit {
    _private: (),
}

impl WritePermit {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Durable table of activation rules keyed by the uniqueness triple.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Inserts a rule or overwrites the mutable fields of the existing one,
    /// forcing it enabled.
    async fn upsert(
        &self,
        permit: &WritePermit,
        activation: &ValidatedActivation,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<RuleChange, ActivationError>;

    /// Flips a rule to disabled. `Ok(None)` when it already was;
    /// `NotFound` when the triple does not exist.
    async fn disable(
        &self,
        permit: &WritePermit,
        key: &RuleKey,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RuleChange>, ActivationError>;

    /// Disables every enabled rule of `tenant`, optionally restricted to `kind`,
    /// as one bulk update.
    async fn disable_matching(
        &self,
        permit: &WritePermit,
        tenant: &str,
        kind: Option<TelemetryKind>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RuleChange>, ActivationError>;

    /// Disables up to `limit` enabled rules whose window closed before `now`.
    async fn expire_batch(
        &self,
        permit: &WritePermit,
        now: DateTime<Utc>,
        limit: usize,
        actor: &str,
    ) -> Result<Vec<RuleChange>, ActivationError>;

    /// Hard-deletes up to `limit` disabled rules last modified before `cutoff`.
    async fn purge_disabled_batch(
        &self,
        permit: &WritePermit,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RuleChange>, ActivationError>;

    async fn get(&self, key: &RuleKey) -> Result<Option<ActivationRule>, ActivationError>;

    /// Every stored rule, oldest first.
    async fn load_all(&self) -> Result<Vec<ActivationRule>, ActivationError>;
}

#[derive(Debug, Default)]
struct MemoryTable {
    next_seq: u64,
    rows: HashMap<RuleKey, (u64, ActivationRule)>,
}

/// In-process rule repository.
#[derive(Debug, Default, Clone)]
pub struct MemoryRuleRepository {
    table: Arc<RwLock<MemoryTable>>,
}

impl MemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn disabled_copy(rule: &ActivationRule, actor: &str, now: DateTime<Utc>) -> ActivationRule {
    let mut disabled = rule.clone();
    disabled.enabled = false;
    disabled.revision += 1;
    disabled.updated_by = Some(actor.to_string());
    disabled.updated_at = Some(now);
    disabled
}

#[async_trait]
impl RuleRepository for MemoryRuleRepository {
    async fn upsert(
        &self,
        _permit: &WritePermit,
        activation: &ValidatedActivation,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<RuleChange, ActivationError> {
        let mut table = self.table.write();
        if let Some((_, existing)) = table.rows.get_mut(&activation.key) {
            let before = existing.clone();
            existing.enabled = true;
            existing.sampling_rate = activation.sampling_rate;
            existing.min_log_level = activation.min_log_level;
            existing.active_from = activation.active_from;
            existing.active_to = activation.active_to;
            existing.revision += 1;
            existing.updated_by = Some(actor.to_string());
            existing.updated_at = Some(now);
            return Ok(RuleChange::update(before, existing.clone()));
        }

        let rule = ActivationRule {
            id: Uuid::new_v4(),
            telemetry_kind: activation.key.telemetry_kind,
            object_pattern: activation.key.object_pattern.clone(),
            tenant_id: activation.key.tenant_id.clone(),
            enabled: true,
            active_from: activation.active_from,
            active_to: activation.active_to,
            sampling_rate: activation.sampling_rate,
            min_log_level: activation.min_log_level,
            revision: 1,
            created_by: actor.to_string(),
            created_at: now,
            updated_by: None,
            updated_at: None,
        };
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(activation.key.clone(), (seq, rule.clone()));
        Ok(RuleChange {
            operation: AuditOperation::Insert,
            before: None,
            after: Some(rule),
        })
    }

    async fn disable(
        &self,
        _permit: &WritePermit,
        key: &RuleKey,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RuleChange>, ActivationError> {
        let mut table = self.table.write();
        let (_, existing) = table
            .rows
            .get_mut(key)
            .ok_or_else(|| ActivationError::NotFound(key.to_string()))?;
        if !existing.enabled {
            return Ok(None);
        }
        let before = existing.clone();
        *existing = disabled_copy(&before, actor, now);
        Ok(Some(RuleChange::update(before, existing.clone())))
    }

    async fn disable_matching(
        &self,
        _permit: &WritePermit,
        tenant: &str,
        kind: Option<TelemetryKind>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RuleChange>, ActivationError> {
        let mut table = self.table.write();
        let mut changes = Vec::new();
        for (_, rule) in table.rows.values_mut() {
            let in_scope = rule.enabled
                && rule.tenant_id == tenant
                && kind.map_or(true, |kind| rule.telemetry_kind == kind);
            if in_scope {
                let before = rule.clone();
                *rule = disabled_copy(&before, actor, now);
                changes.push(RuleChange::update(before, rule.clone()));
            }
        }
        Ok(changes)
    }

    async fn expire_batch(
        &self,
        _permit: &WritePermit,
        now: DateTime<Utc>,
        limit: usize,
        actor: &str,
    ) -> Result<Vec<RuleChange>, ActivationError> {
        let mut table = self.table.write();
        let mut expired: Vec<(DateTime<Utc>, RuleKey)> = table
            .rows
            .iter()
            .filter(|(_, (_, rule))| rule.enabled && rule.is_expired_at(now))
            .filter_map(|(key, (_, rule))| rule.active_to.map(|end| (end, key.clone())))
            .collect();
        expired.sort();
        expired.truncate(limit);

        let mut changes = Vec::with_capacity(expired.len());
        for (_, key) in expired {
            if let Some((_, rule)) = table.rows.get_mut(&key) {
                let before = rule.clone();
                *rule = disabled_copy(&before, actor, now);
                changes.push(RuleChange::update(before, rule.clone()));
            }
        }
        Ok(changes)
    }

    async fn purge_disabled_batch(
        &self,
        _permit: &WritePermit,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RuleChange>, ActivationError> {
        let mut table = self.table.write();
        let mut stale: Vec<(DateTime<Utc>, RuleKey)> = table
            .rows
            .iter()
            .filter(|(_, (_, rule))| !rule.enabled && rule.last_modified() < cutoff)
            .map(|(key, (_, rule))| (rule.last_modified(), key.clone()))
            .collect();
        stale.sort();
        stale.truncate(limit);

        Ok(stale
            .into_iter()
            .filter_map(|(_, key)| table.rows.remove(&key))
            .map(|(_, rule)| RuleChange {
                operation: AuditOperation::Delete,
                before: Some(rule),
                after: None,
            })
            .collect())
    }

    async fn get(&self, key: &RuleKey) -> Result<Option<ActivationRule>, ActivationError> {
        Ok(self.table.read().rows.get(key).map(|(_, rule)| rule.clone()))
    }

    async fn load_all(&self) -> Result<Vec<ActivationRule>, ActivationError> {
        let table = self.table.read();
        let mut rows: Vec<&(u64, ActivationRule)> = table.rows.values().collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, rule)| rule.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{validate, EnableRequest};
    use chrono::Duration;

    fn activation(pattern: &str, tenant: &str) -> ValidatedActivation {
        validate(&EnableRequest::new(pattern, TelemetryKind::Trace, tenant), Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn upsert_on_existing_triple_updates_in_place() {
        let repo = MemoryRuleRepository::new();
        let permit = WritePermit::new();
        let now = Utc::now();

        let first = repo.upsert(&permit, &activation("ORDER_PKG.*", "T1"), "alice", now).await.unwrap();
        assert_eq!(first.operation, AuditOperation::Insert);

        let key = RuleKey::new(TelemetryKind::Trace, "order_pkg.*", "T1");
        repo.disable(&permit, &key, "bob", now).await.unwrap();

        let mut again = activation("order_pkg.*", "T1");
        again.sampling_rate = 0.5;
        let second = repo.upsert(&permit, &again, "carol", now).await.unwrap();
        assert_eq!(second.operation, AuditOperation::Update);
        let after = second.after.unwrap();
        assert!(after.enabled);
        assert_eq!(after.sampling_rate, 0.5);
        assert_eq!(after.revision, 3);
        assert_eq!(after.created_by, "alice");
        assert_eq!(repo.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disable_reports_missing_and_repeated_calls() {
        let repo = MemoryRuleRepository::new();
        let permit = WritePermit::new();
        let key = RuleKey::new(TelemetryKind::Trace, "A", "T1");
        assert!(matches!(
            repo.disable(&permit, &key, "x", Utc::now()).await,
            Err(ActivationError::NotFound(_))
        ));

        repo.upsert(&permit, &activation("A", "T1"), "x", Utc::now()).await.unwrap();
        assert!(repo.disable(&permit, &key, "x", Utc::now()).await.unwrap().is_some());
        assert!(repo.disable(&permit, &key, "x", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiry_and_purge_respect_batch_limits() {
        let repo = MemoryRuleRepository::new();
        let permit = WritePermit::new();
        let start = Utc::now() - Duration::hours(2);
        for pattern in ["A", "B", "C"] {
            let mut windowed = activation(pattern, "T1");
            windowed.active_from = start;
            windowed.active_to = Some(start + Duration::minutes(30));
            repo.upsert(&permit, &windowed, "x", start).await.unwrap();
        }
        repo.upsert(&permit, &activation("D", "T1"), "x", start).await.unwrap();

        let now = Utc::now();
        assert_eq!(repo.expire_batch(&permit, now, 2, "sweeper").await.unwrap().len(), 2);
        assert_eq!(repo.expire_batch(&permit, now, 2, "sweeper").await.unwrap().len(), 1);
        assert!(repo.expire_batch(&permit, now, 2, "sweeper").await.unwrap().is_empty());

        let purged = repo
            .purge_disabled_batch(&permit, now + Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(purged.len(), 3);
        assert!(purged.iter().all(|change| change.operation == AuditOperation::Delete));
        let remaining = repo.load_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].object_pattern, "D");
    }
}
