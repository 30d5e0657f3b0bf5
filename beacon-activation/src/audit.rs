use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::context::{AdminContext, SessionContext};
use crate::error::ActivationError;
use crate::kind::{LogLevel, TelemetryKind};
use crate::repository::RuleChange;
use crate::rule::{ActivationRule, RuleKey};
use crate::sink::{AuditEvent, AuditSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOperation {
    Insert,
    Update,
    Delete,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Insert => "INSERT",
            AuditOperation::Update => "UPDATE",
            AuditOperation::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INSERT" => Some(AuditOperation::Insert),
            "UPDATE" => Some(AuditOperation::Update),
            "DELETE" => Some(AuditOperation::Delete),
            _ => None,
        }
    }
}

/// The mutable fields of a rule at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub enabled: bool,
    pub sampling_rate: f64,
    pub min_log_level: Option<LogLevel>,
    pub active_from: DateTime<Utc>,
    pub active_to: Option<DateTime<Utc>>,
}

impl From<&ActivationRule> for RuleSnapshot {
    fn from(rule: &ActivationRule) -> Self {
        Self {
            enabled: rule.enabled,
            sampling_rate: rule.sampling_rate,
            min_log_level: rule.min_log_level,
            active_from: rule.active_from,
            active_to: rule.active_to,
        }
    }
}

/// Immutable record of one mutation of an activation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub operation: AuditOperation,
    pub telemetry_kind: TelemetryKind,
    pub object_pattern: String,
    pub tenant_id: String,
    pub before: Option<RuleSnapshot>,
    pub after: Option<RuleSnapshot>,
    pub actor: String,
    pub session: SessionContext,
    pub changed_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Builds the record for a committed change, or `None` if the change is empty.
    pub fn capture(change: &RuleChange, ctx: &AdminContext, changed_at: DateTime<Utc>) -> Option<Self> {
        let subject = change.after.as_ref().or(change.before.as_ref())?;
        Some(Self {
            id: Uuid::new_v4(),
            operation: change.operation,
            telemetry_kind: subject.telemetry_kind,
            object_pattern: subject.object_pattern.clone(),
            tenant_id: subject.tenant_id.clone(),
            before: change.before.as_ref().map(RuleSnapshot::from),
            after: change.after.as_ref().map(RuleSnapshot::from),
            actor: ctx.actor.clone(),
            session: ctx.session.clone(),
            changed_at,
        })
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            telemetry_kind: self.telemetry_kind,
            object_pattern: self.object_pattern.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }

    pub fn old_enabled(&self) -> Option<bool> {
        self.before.as_ref().map(|snapshot| snapshot.enabled)
    }

    pub fn new_enabled(&self) -> Option<bool> {
        self.after.as_ref().map(|snapshot| snapshot.enabled)
    }
}

/// Append-only store of audit records.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), ActivationError>;

    /// Deletes at most `limit` records older than `cutoff`, returning how many went.
    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize, ActivationError>;

    /// Records changed at or after `cutoff`, newest first.
    async fn since(
        &self,
        cutoff: DateTime<Utc>,
        tenant: Option<&str>,
    ) -> Result<Vec<AuditRecord>, ActivationError>;

    /// Every record for one rule, oldest first.
    async fn history(&self, key: &RuleKey) -> Result<Vec<AuditRecord>, ActivationError>;
}

/// In-process audit repository.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditRepository {
    records: Arc<RwLock<VecDeque<AuditRecord>>>,
}

impl MemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditRepository for MemoryAuditRepository {
    async fn append(&self, record: &AuditRecord) -> Result<(), ActivationError> {
        self.records.write().push_back(record.clone());
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize, ActivationError> {
        let mut records = self.records.write();
        let mut removed = 0;
        records.retain(|record| {
            if removed < limit && record.changed_at < cutoff {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn since(
        &self,
        cutoff: DateTime<Utc>,
        tenant: Option<&str>,
    ) -> Result<Vec<AuditRecord>, ActivationError> {
        let records = self.records.read();
        let mut recent: Vec<AuditRecord> = records
            .iter()
            .filter(|record| record.changed_at >= cutoff)
            .filter(|record| tenant.map_or(true, |tenant| record.tenant_id == tenant))
            .cloned()
            .collect();
        recent.reverse();
        recent.sort_by(|a, b| b.changed_at.cmp(&a.changed_at));
        Ok(recent)
    }

    async fn history(&self, key: &RuleKey) -> Result<Vec<AuditRecord>, ActivationError> {
        let records = self.records.read();
        Ok(records
            .iter()
            .filter(|record| &record.key() == key)
            .cloned()
            .collect())
    }
}

/// Change-capture intercept applied to every committed rule mutation.
///
/// The record is written through its own repository in a spawned task, so it
/// survives the caller going away, and neither a repository nor a sink failure
/// reaches the caller.
#[derive(Clone)]
pub struct AuditTrail {
    repository: Arc<dyn AuditRepository>,
    sink: Arc<dyn AuditSink>,
}

impl AuditTrail {
    pub fn new(repository: Arc<dyn AuditRepository>, sink: Arc<dyn AuditSink>) -> Self {
        Self { repository, sink }
    }

    pub fn repository(&self) -> &Arc<dyn AuditRepository> {
        &self.repository
    }

    pub async fn capture(&self, change: &RuleChange, ctx: &AdminContext) -> Option<AuditRecord> {
        let record = AuditRecord::capture(change, ctx, Utc::now())?;

        let repository = self.repository.clone();
        let stored = record.clone();
        let write = tokio::spawn(async move { repository.append(&stored).await });
        match write.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(audit_id = %record.id, %err, "failed to persist audit record");
            }
            Err(err) => {
                warn!(audit_id = %record.id, %err, "audit write task aborted");
            }
        }

        if let Err(err) = self.sink.emit(&AuditEvent::from(&record)) {
            warn!(audit_id = %record.id, %err, "audit event dropped");
        }

        Some(record)
    }
}
