use std::collections::HashMap;

use async_trait::async_trait;
use beacon_core::db::{DatabaseMigrator, DatabasePool};
use beacon_core::{BeaconError, CoreResult};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::audit::{AuditOperation, AuditRecord, AuditRepository, RuleSnapshot};
use crate::context::SessionContext;
use crate::error::ActivationError;
use crate::kind::TelemetryKind;
use crate::repository::{RuleChange, RuleRepository, WritePermit};
use crate::rule::{ActivationRule, RuleKey};
use crate::validation::ValidatedActivation;

const RULE_COLUMNS: &str = "id, telemetry_kind, object_pattern, tenant_id, enabled, active_from, active_to, \
     sampling_rate, min_log_level, revision, created_by, created_at, updated_by, updated_at";

const AUDIT_COLUMNS: &str = "id, operation, telemetry_kind, object_pattern, tenant_id, before_state, after_state, \
     actor, session, changed_at";

/// Applies the activation schema.
pub struct ActivationMigrator;

#[async_trait]
impl DatabaseMigrator for ActivationMigrator {
    async fn run_migrations(&self, pool: &DatabasePool) -> CoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(pool.inner())
            .await
            .map_err(|err| BeaconError::MigrationError(err.to_string()))
    }
}

#[derive(FromRow)]
struct RuleRow {
    id: Uuid,
    telemetry_kind: String,
    object_pattern: String,
    tenant_id: String,
    enabled: bool,
    active_from: DateTime<Utc>,
    active_to: Option<DateTime<Utc>>,
    sampling_rate: f64,
    min_log_level: Option<String>,
    revision: i64,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_by: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<RuleRow> for ActivationRule {
    type Error = ActivationError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(ActivationRule {
            id: row.id,
            telemetry_kind: row.telemetry_kind.parse()?,
            object_pattern: row.object_pattern,
            tenant_id: row.tenant_id,
            enabled: row.enabled,
            active_from: row.active_from,
            active_to: row.active_to,
            sampling_rate: row.sampling_rate,
            min_log_level: row.min_log_level.map(|level| level.parse()).transpose()?,
            revision: row.revision,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_by: row.updated_by,
            updated_at: row.updated_at,
        })
    }
}

fn into_rules(rows: Vec<RuleRow>) -> Result<Vec<ActivationRule>, ActivationError> {
    rows.into_iter().map(ActivationRule::try_from).collect()
}

/// Pairs locked pre-images with the rows an UPDATE returned.
fn pair_updates(
    before: Vec<ActivationRule>,
    after: Vec<ActivationRule>,
) -> Vec<RuleChange> {
    let mut after: HashMap<Uuid, ActivationRule> = after.into_iter().map(|rule| (rule.id, rule)).collect();
    before
        .into_iter()
        .filter_map(|before| {
            after.remove(&before.id).map(|after| RuleChange {
                operation: AuditOperation::Update,
                before: Some(before),
                after: Some(after),
            })
        })
        .collect()
}

fn limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Rule repository over the `activation_rules` table.
#[derive(Clone)]
pub struct PgRuleRepository {
    pool: DatabasePool,
}

impl PgRuleRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn lock_key(
        tx: &mut Transaction<'_, Postgres>,
        key: &RuleKey,
    ) -> Result<Option<ActivationRule>, ActivationError> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM activation_rules \
             WHERE telemetry_kind = $1 AND object_pattern = $2 AND tenant_id = $3 FOR UPDATE"
        );
        let row = sqlx::query_as::<_, RuleRow>(&sql)
            .bind(key.telemetry_kind.as_str())
            .bind(&key.object_pattern)
            .bind(&key.tenant_id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(ActivationRule::try_from).transpose()
    }

    /// Inserts a fresh rule; `None` when the triple already exists.
    async fn insert_new(
        tx: &mut Transaction<'_, Postgres>,
        activation: &ValidatedActivation,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ActivationRule>, ActivationError> {
        let sql = format!(
            "INSERT INTO activation_rules ( \
                 id, telemetry_kind, object_pattern, tenant_id, enabled, active_from, active_to, \
                 sampling_rate, min_log_level, revision, created_by, created_at \
             ) VALUES ($1, $2, $3, $4, TRUE, $5, $6, $7, $8, 1, $9, $10) \
             ON CONFLICT (telemetry_kind, object_pattern, tenant_id) DO NOTHING \
             RETURNING {RULE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RuleRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(activation.key.telemetry_kind.as_str())
            .bind(&activation.key.object_pattern)
            .bind(&activation.key.tenant_id)
            .bind(activation.active_from)
            .bind(activation.active_to)
            .bind(activation.sampling_rate)
            .bind(activation.min_log_level.map(|level| level.as_str()))
            .bind(actor)
            .bind(now)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(ActivationRule::try_from).transpose()
    }

    async fn disable_ids(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[Uuid],
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActivationRule>, ActivationError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE activation_rules \
             SET enabled = FALSE, revision = revision + 1, updated_by = $2, updated_at = $3 \
             WHERE id = ANY($1) RETURNING {RULE_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, RuleRow>(&sql)
            .bind(ids)
            .bind(actor)
            .bind(now)
            .fetch_all(&mut **tx)
            .await?;
        into_rules(rows)
    }
}

#[async_trait]
impl RuleRepository for PgRuleRepository {
    async fn upsert(
        &self,
        _permit: &WritePermit,
        activation: &ValidatedActivation,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<RuleChange, ActivationError> {
        let mut tx = self.pool.inner().begin().await?;
        let mut before = Self::lock_key(&mut tx, &activation.key).await?;

        if before.is_none() {
            if let Some(inserted) = Self::insert_new(&mut tx, activation, actor, now).await? {
                tx.commit().await?;
                return Ok(RuleChange {
                    operation: AuditOperation::Insert,
                    before: None,
                    after: Some(inserted),
                });
            }
            // Another writer committed the same triple first; update its row instead.
            before = Self::lock_key(&mut tx, &activation.key).await?;
        }
        let before = before
            .ok_or_else(|| ActivationError::Storage(format!("rule {} vanished during upsert", activation.key)))?;

        let sql = format!(
            "UPDATE activation_rules SET \
                 enabled = TRUE, active_from = $2, active_to = $3, sampling_rate = $4, \
                 min_log_level = $5, revision = revision + 1, updated_by = $6, updated_at = $7 \
             WHERE id = $1 RETURNING {RULE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RuleRow>(&sql)
            .bind(before.id)
            .bind(activation.active_from)
            .bind(activation.active_to)
            .bind(activation.sampling_rate)
            .bind(activation.min_log_level.map(|level| level.as_str()))
            .bind(actor)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(RuleChange {
            operation: AuditOperation::Update,
            before: Some(before),
            after: Some(ActivationRule::try_from(row)?),
        })
    }

    async fn disable(
        &self,
        _permit: &WritePermit,
        key: &RuleKey,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RuleChange>, ActivationError> {
        let mut tx = self.pool.inner().begin().await?;
        let before = Self::lock_key(&mut tx, key)
            .await?
            .ok_or_else(|| ActivationError::NotFound(key.to_string()))?;
        if !before.enabled {
            return Ok(None);
        }
        let after = Self::disable_ids(&mut tx, &[before.id], actor, now).await?;
        tx.commit().await?;
        Ok(pair_updates(vec![before], after).into_iter().next())
    }

    async fn disable_matching(
        &self,
        _permit: &WritePermit,
        tenant: &str,
        kind: Option<TelemetryKind>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RuleChange>, ActivationError> {
        let mut tx = self.pool.inner().begin().await?;
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM activation_rules \
             WHERE tenant_id = $1 AND enabled AND ($2::TEXT IS NULL OR telemetry_kind = $2) \
             FOR UPDATE"
        );
        let before = into_rules(
            sqlx::query_as::<_, RuleRow>(&sql)
                .bind(tenant)
                .bind(kind.map(|kind| kind.as_str()))
                .fetch_all(&mut *tx)
                .await?,
        )?;
        let ids: Vec<Uuid> = before.iter().map(|rule| rule.id).collect();
        let after = Self::disable_ids(&mut tx, &ids, actor, now).await?;
        tx.commit().await?;
        Ok(pair_updates(before, after))
    }

    async fn expire_batch(
        &self,
        _permit: &WritePermit,
        now: DateTime<Utc>,
        batch: usize,
        actor: &str,
    ) -> Result<Vec<RuleChange>, ActivationError> {
        let mut tx = self.pool.inner().begin().await?;
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM activation_rules \
             WHERE enabled AND active_to IS NOT NULL AND active_to < $1 \
             ORDER BY active_to LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        let before = into_rules(
            sqlx::query_as::<_, RuleRow>(&sql)
                .bind(now)
                .bind(limit(batch))
                .fetch_all(&mut *tx)
                .await?,
        )?;
        let ids: Vec<Uuid> = before.iter().map(|rule| rule.id).collect();
        let after = Self::disable_ids(&mut tx, &ids, actor, now).await?;
        tx.commit().await?;
        Ok(pair_updates(before, after))
    }

    async fn purge_disabled_batch(
        &self,
        _permit: &WritePermit,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<RuleChange>, ActivationError> {
        let sql = format!(
            "DELETE FROM activation_rules WHERE id IN ( \
                 SELECT id FROM activation_rules \
                 WHERE NOT enabled AND COALESCE(updated_at, created_at) < $1 \
                 ORDER BY COALESCE(updated_at, created_at) LIMIT $2 FOR UPDATE SKIP LOCKED \
             ) RETURNING {RULE_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, RuleRow>(&sql)
            .bind(cutoff)
            .bind(limit(batch))
            .fetch_all(self.pool.inner())
            .await?;
        Ok(into_rules(rows)?
            .into_iter()
            .map(|rule| RuleChange {
                operation: AuditOperation::Delete,
                before: Some(rule),
                after: None,
            })
            .collect())
    }

    async fn get(&self, key: &RuleKey) -> Result<Option<ActivationRule>, ActivationError> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM activation_rules \
             WHERE telemetry_kind = $1 AND object_pattern = $2 AND tenant_id = $3"
        );
        let row = sqlx::query_as::<_, RuleRow>(&sql)
            .bind(key.telemetry_kind.as_str())
            .bind(&key.object_pattern)
            .bind(&key.tenant_id)
            .fetch_optional(self.pool.inner())
            .await?;
        row.map(ActivationRule::try_from).transpose()
    }

    async fn load_all(&self) -> Result<Vec<ActivationRule>, ActivationError> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM activation_rules ORDER BY created_at, id");
        let rows = sqlx::query_as::<_, RuleRow>(&sql)
            .fetch_all(self.pool.inner())
            .await?;
        into_rules(rows)
    }
}

#[derive(FromRow)]
struct AuditRow {
    id: Uuid,
    operation: String,
    telemetry_kind: String,
    object_pattern: String,
    tenant_id: String,
    before_state: Option<Json<RuleSnapshot>>,
    after_state: Option<Json<RuleSnapshot>>,
    actor: String,
    session: Json<SessionContext>,
    changed_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = ActivationError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let operation = AuditOperation::parse(&row.operation)
            .ok_or_else(|| ActivationError::Storage(format!("unknown audit operation {}", row.operation)))?;
        Ok(AuditRecord {
            id: row.id,
            operation,
            telemetry_kind: row.telemetry_kind.parse()?,
            object_pattern: row.object_pattern,
            tenant_id: row.tenant_id,
            before: row.before_state.map(|Json(snapshot)| snapshot),
            after: row.after_state.map(|Json(snapshot)| snapshot),
            actor: row.actor,
            session: row.session.0,
            changed_at: row.changed_at,
        })
    }
}

fn into_records(rows: Vec<AuditRow>) -> Result<Vec<AuditRecord>, ActivationError> {
    rows.into_iter().map(AuditRecord::try_from).collect()
}

/// Audit repository over the `activation_audit` table.
///
/// Give it its own pool: audit inserts then commit independently of rule writes.
#[derive(Clone)]
pub struct PgAuditRepository {
    pool: DatabasePool,
}

impl PgAuditRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    async fn append(&self, record: &AuditRecord) -> Result<(), ActivationError> {
        sqlx::query(
            r#"
            INSERT INTO activation_audit (
                id, operation, telemetry_kind, object_pattern, tenant_id,
                old_enabled, new_enabled, before_state, after_state,
                actor, session, changed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(record.operation.as_str())
        .bind(record.telemetry_kind.as_str())
        .bind(&record.object_pattern)
        .bind(&record.tenant_id)
        .bind(record.old_enabled())
        .bind(record.new_enabled())
        .bind(record.before.clone().map(Json))
        .bind(record.after.clone().map(Json))
        .bind(&record.actor)
        .bind(Json(record.session.clone()))
        .bind(record.changed_at)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>, batch: usize) -> Result<usize, ActivationError> {
        let result = sqlx::query(
            r#"
            DELETE FROM activation_audit WHERE id IN (
                SELECT id FROM activation_audit
                WHERE changed_at < $1
                ORDER BY changed_at LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit(batch))
        .execute(self.pool.inner())
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn since(
        &self,
        cutoff: DateTime<Utc>,
        tenant: Option<&str>,
    ) -> Result<Vec<AuditRecord>, ActivationError> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM activation_audit \
             WHERE changed_at >= $1 AND ($2::TEXT IS NULL OR tenant_id = $2) \
             ORDER BY changed_at DESC"
        );
        let rows = sqlx::query_as::<_, AuditRow>(&sql)
            .bind(cutoff)
            .bind(tenant)
            .fetch_all(self.pool.inner())
            .await?;
        into_records(rows)
    }

    async fn history(&self, key: &RuleKey) -> Result<Vec<AuditRecord>, ActivationError> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM activation_audit \
             WHERE telemetry_kind = $1 AND object_pattern = $2 AND tenant_id = $3 \
             ORDER BY changed_at"
        );
        let rows = sqlx::query_as::<_, AuditRow>(&sql)
            .bind(key.telemetry_kind.as_str())
            .bind(&key.object_pattern)
            .bind(&key.tenant_id)
            .fetch_all(self.pool.inner())
            .await?;
        into_records(rows)
    }
}
