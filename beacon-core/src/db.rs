use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::errors::Result;

/// Wrapper around a Postgres connection pool.
///
/// Rule writes and audit writes use separate pools so that neither commit
/// scope can hold up or roll back the other.
#[derive(Clone)]
pub struct DatabasePool {
    pool: Pool<Postgres>,
}

impl DatabasePool {
    /// Establishes a connection pool directly from a database URL.
    pub async fn connect_with_url(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        info!(max_connections, "connected postgres pool");
        Ok(Self { pool })
    }

    /// Builds a pool that connects on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn inner(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

/// Trait implemented by components that own database migrations.
#[async_trait]
pub trait DatabaseMigrator {
    async fn run_migrations(&self, pool: &DatabasePool) -> Result<()>;
}

/// Run migrations by delegating to the provided migrators.
pub async fn run_migrations(
    pool: &DatabasePool,
    migrators: &[Box<dyn DatabaseMigrator + Send + Sync>],
) -> Result<()> {
    for migrator in migrators {
        migrator.run_migrations(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingMigrator(Arc<AtomicUsize>);

    #[async_trait]
    impl DatabaseMigrator for CountingMigrator {
        async fn run_migrations(&self, _pool: &DatabasePool) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_all_migrators() {
        let pool = DatabasePool::connect_lazy("postgres://localhost/postgres").expect("lazy pool");
        let counter = Arc::new(AtomicUsize::new(0));
        let migrators: Vec<Box<dyn DatabaseMigrator + Send + Sync>> = vec![
            Box::new(CountingMigrator(counter.clone())),
            Box::new(CountingMigrator(counter.clone())),
        ];
        run_migrations(&pool, &migrators)
            .await
            .expect("should run migrations");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
