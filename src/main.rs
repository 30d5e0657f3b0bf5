use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use beacon_activation::{
    load_seed, ActivationApiBuilder, ActivationMigrator, ActivationStore, AuditRepository, AuditSink, AuditTrail,
    ChannelAuditSink, MemoryAuditRepository, MemoryRuleRepository, PgAuditRepository, PgRuleRepository,
    RuleRepository, TracingAuditSink,
};
use beacon_core::db::{run_migrations, DatabaseMigrator, DatabasePool};
use beacon_core::CoreConfig;
use clap::Parser;
use tracing::{error, info, warn};

const RULE_POOL_CONNECTIONS: u32 = 10;
const AUDIT_POOL_CONNECTIONS: u32 = 2;

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Telemetry activation control service", long_about = None)]
struct Args {
    /// Address for the operator API (overrides BEACON_HTTP_BIND)
    #[arg(long)]
    bind: Option<String>,
    /// YAML/JSON file or directory of activations applied at startup
    #[arg(long)]
    seed: Option<PathBuf>,
    /// Default log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(err) = beacon_core::logging::init_tracing(args.log_level.as_deref()) {
        eprintln!("failed to initialise tracing: {err}");
    }

    let config = CoreConfig::from_env().context("failed to load configuration")?;
    let settings = &config.activation;

    let (repository, audit_repository) = open_repositories(&config).await?;
    let audit = AuditTrail::new(audit_repository, spawn_audit_forwarder(settings.audit_channel_capacity));
    let store = ActivationStore::new(repository, audit).with_batch_size(settings.maintenance_batch_size);

    let loaded = store.hydrate().await.context("failed to load activation rules")?;
    info!(loaded, cached = store.cache().len(), "activation rules loaded");
    if settings.cache_refresh_secs > 0 {
        store.spawn_refresh(Duration::from_secs(settings.cache_refresh_secs));
    }

    if let Some(seed) = args.seed.as_ref().or(settings.rules_seed.as_ref()) {
        let rules = load_seed(seed).with_context(|| format!("failed to load seed {}", seed.display()))?;
        let outcome = store.apply_seed(&rules).await;
        if outcome.failed > 0 {
            warn!(failed = outcome.failed, failures = ?outcome.failures, "some seed activations were rejected");
        }
    }

    let router = ActivationApiBuilder::new(store)
        .with_keep_days(settings.audit_retention_days)
        .into_router();

    let bind = args.bind.unwrap_or_else(|| config.http_bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let actual_addr = listener.local_addr().context("failed to read socket address")?;
    info!(%actual_addr, node = %config.node_name, "starting beacon");

    if let Err(err) = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(?err, "beacon server terminated with error");
    }

    Ok(())
}

/// Postgres repositories when a database is configured, in-memory ones otherwise.
///
/// Rule and audit writes get separate pools.
async fn open_repositories(
    config: &CoreConfig,
) -> anyhow::Result<(Arc<dyn RuleRepository>, Arc<dyn AuditRepository>)> {
    let Some(url) = config.database_url() else {
        warn!("no database configured, activation rules are kept in memory");
        return Ok((
            Arc::new(MemoryRuleRepository::new()),
            Arc::new(MemoryAuditRepository::new()),
        ));
    };

    let rules_pool = DatabasePool::connect_with_url(url, RULE_POOL_CONNECTIONS)
        .await
        .context("failed to connect rule pool")?;
    let audit_pool = DatabasePool::connect_with_url(url, AUDIT_POOL_CONNECTIONS)
        .await
        .context("failed to connect audit pool")?;

    let migrators: Vec<Box<dyn DatabaseMigrator + Send + Sync>> = vec![Box::new(ActivationMigrator)];
    run_migrations(&rules_pool, &migrators)
        .await
        .context("failed to migrate activation schema")?;

    Ok((
        Arc::new(PgRuleRepository::new(rules_pool)),
        Arc::new(PgAuditRepository::new(audit_pool)),
    ))
}

/// Moves audit events off the administrative path onto a background logger.
fn spawn_audit_forwarder(capacity: usize) -> Arc<dyn AuditSink> {
    let (sink, mut receiver) = ChannelAuditSink::new(capacity);
    tokio::spawn(async move {
        let logger = TracingAuditSink;
        while let Some(event) = receiver.recv().await {
            if let Err(err) = logger.emit(&event) {
                warn!(%err, "audit event not logged");
            }
        }
    });
    Arc::new(sink)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sigterm) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
