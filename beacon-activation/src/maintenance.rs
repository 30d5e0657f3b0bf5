use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::AdminContext;
use crate::error::ActivationError;
use crate::repository::WritePermit;
use crate::store::ActivationStore;
use crate::validation::days_before;

/// Retention applied by [`ActivationStore::purge_old_records`] when the caller has no preference.
pub const DEFAULT_KEEP_DAYS: u32 = 90;

const MAINTENANCE_ACTOR: &str = "maintenance";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub rules_deleted: usize,
    pub audit_records_deleted: usize,
}

/// Scheduler-facing sweeps. Both run in bounded batches and can be re-run
/// safely; interrupting one leaves the remaining work for the next call.
impl ActivationStore {
    /// Disables every enabled rule whose window has closed.
    pub async fn expire_stale_rules(&self) -> Result<usize, ActivationError> {
        self.expire_stale_rules_at(Utc::now()).await
    }

    pub async fn expire_stale_rules_at(&self, now: DateTime<Utc>) -> Result<usize, ActivationError> {
        let ctx = AdminContext::system(MAINTENANCE_ACTOR);
        let permit = WritePermit::new();
        let mut expired = 0;
        loop {
            let batch = self
                .repository
                .expire_batch(&permit, now, self.batch_size, &ctx.actor)
                .await?;
            let count = batch.len();
            for change in batch {
                self.commit(&ctx, change).await;
            }
            expired += count;
            if count < self.batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        if expired > 0 {
            info!(expired, "expired stale activation rules");
        }
        Ok(expired)
    }

    /// Hard-deletes disabled rules and audit records older than `keep_days`.
    pub async fn purge_old_records(&self, keep_days: u32) -> Result<PurgeReport, ActivationError> {
        self.purge_old_records_at(keep_days, Utc::now()).await
    }

    pub async fn purge_old_records_at(
        &self,
        keep_days: u32,
        now: DateTime<Utc>,
    ) -> Result<PurgeReport, ActivationError> {
        let cutoff = days_before(now, keep_days)?;
        let ctx = AdminContext::system(MAINTENANCE_ACTOR);
        let permit = WritePermit::new();
        let mut report = PurgeReport::default();

        let audit = self.audit.repository();
        loop {
            let count = audit.purge_before(cutoff, self.batch_size).await?;
            report.audit_records_deleted += count;
            if count < self.batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        loop {
            let batch = self
                .repository
                .purge_disabled_batch(&permit, cutoff, self.batch_size)
                .await?;
            let count = batch.len();
            for change in batch {
                self.commit(&ctx, change).await;
            }
            report.rules_deleted += count;
            if count < self.batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        info!(
            keep_days,
            rules_deleted = report.rules_deleted,
            audit_records_deleted = report.audit_records_deleted,
            "purged old activation records"
        );
        Ok(report)
    }
}
