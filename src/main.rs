use std::sync::Arc;

use anyhow::Context;

use automation_runner::config::{ExecutorConfig, RunnerConfig};
use automation_runner::executor::HttpTaskExecutor;
use automation_runner::identity::DefaultIdentityResolver;
use automation_runner::runner::{JobRunner, RunnerDeps, StoreContextCloner};
use automation_runner::store::{JobStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RunnerConfig::from_env().context("invalid runner configuration")?;
    let executor_config = ExecutorConfig::from_env().context("invalid executor configuration")?;

    eprintln!("Automation runner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Runner: {}", config.runner_id);
    eprintln!("   Executor: {}", executor_config.endpoint);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::env::var("AUTOMATION_DB_PATH")
        .unwrap_or_else(|_| "./data/automation.db".to_string());
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .with_context(|| format!("failed to open database at {db_path}"))?,
    );
    eprintln!("   Database: {db_path}");

    let runner = Arc::new(JobRunner::new(
        config.clone(),
        RunnerDeps {
            store: store.clone(),
            executor: Arc::new(HttpTaskExecutor::new(executor_config)?),
            identity: Arc::new(DefaultIdentityResolver::new(config.default_roles.clone())),
            cloner: Arc::new(StoreContextCloner::new(store)),
        },
    ));

    runner.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, waiting for in-flight jobs");
    runner.stop().await;

    Ok(())
}
