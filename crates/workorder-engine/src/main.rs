//! Work-order escalator.
//!
//! Long-running process that scans PostgreSQL for instances whose current
//! step outlived its time limit and applies the configured escalation
//! rules. Several replicas may run side by side.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use workorder_engine::{
    config::{DatabaseConfig, EngineConfig},
    db::{create_pool, pool::health_check, PgStore},
    directory::StaticDirectory,
    nats::NatsNotifier,
    notify::{Notifier, TracingNotifier},
    EscalationScheduler, WorkOrderEngine,
};

/// Initialize tracing. `WORKORDER_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,workorder_engine=debug".into());

    let json = std::env::var("WORKORDER_LOG_FORMAT").is_ok_and(|f| f == "json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Role and department tables used by `reassign` escalations.
fn load_directory(config: &EngineConfig) -> anyhow::Result<StaticDirectory> {
    let Some(ref path) = config.directory_file else {
        tracing::warn!("No directory file configured, role and dept lookups resolve to nobody");
        return Ok(StaticDirectory::new());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading directory file {}", path))?;
    let directory = StaticDirectory::from_yaml(&content)?;
    tracing::info!(path = %path, "Directory loaded");
    Ok(directory)
}

/// Publish events to NATS if configured, otherwise only log them.
async fn build_notifier(config: &EngineConfig) -> Arc<dyn Notifier> {
    match config.nats_url {
        Some(ref url) => match NatsNotifier::connect(url, Some(&config.nats_subject_prefix)).await {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                tracing::warn!(error = %e, url = %url, "Failed to connect to NATS, logging events instead");
                Arc::new(TracingNotifier)
            }
        },
        None => {
            tracing::info!("NATS not configured, logging events only");
            Arc::new(TracingNotifier)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting work-order escalator"
    );

    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load engine config, using defaults");
        EngineConfig::default()
    });
    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    tracing::info!(
        poll_interval_secs = config.poll_interval_secs,
        scan_batch = config.scan_batch,
        system_actor = %config.system_actor,
        "Configuration loaded"
    );

    let pool = create_pool(&db_config).await?;
    if !health_check(&pool).await {
        anyhow::bail!("database {} is not answering", db_config.target());
    }
    let store = PgStore::new(pool);
    store.init_schema().await?;

    let directory = Arc::new(load_directory(&config)?);
    let notifier = build_notifier(&config).await;

    let engine = Arc::new(WorkOrderEngine::new(
        Arc::new(store),
        directory,
        notifier,
        &config,
    ));
    let scheduler = EscalationScheduler::new(engine, &config);

    scheduler.run(shutdown_signal()).await;

    tracing::info!("Escalator shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
