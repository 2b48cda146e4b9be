use std::sync::Arc;

use procflow_core::config::Settings;
use procflow_core::env::RunnerEnv;
use procflow_core::retention;
use procflow_core::store::OrchStore;
use procflow_core::store_memory::MemoryStore;
use procflow_core::worker::Worker;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let settings = Settings::from_env();
    let store = build_store(database_url()).await?;
    let env = RunnerEnv::new(store, settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let retention_task = tokio::spawn(retention::retention_loop(env.clone(), shutdown_rx.clone()));

    let worker = Worker::new(env, std::env::var("WORKER_ID").ok());
    tracing::info!(worker_id = worker.worker_id(), "starting worker loop");
    let worker_task = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received: draining");
    shutdown_tx.send(true)?;
    worker_task.await?;
    retention_task.abort();

    Ok(())
}

/// Where run state lives: the `DATABASE_URL` env var, overridable with a
/// `--database-url <url>` (or `--database-url=<url>`) argument.
fn database_url() -> Option<String> {
    let mut url = std::env::var("DATABASE_URL").ok();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--database-url" {
            url = args.next();
        } else if let Some(value) = arg.strip_prefix("--database-url=") {
            url = Some(value.to_string());
        }
    }
    url.filter(|u| !u.trim().is_empty())
}

#[cfg(feature = "postgres")]
async fn build_store(url: Option<String>) -> Result<Arc<dyn OrchStore>, BoxError> {
    let Some(url) = url else {
        tracing::info!("no database configured, keeping runs in memory");
        return Ok(Arc::new(MemoryStore::new()));
    };
    tracing::info!("opening postgres pool");
    let pool = sqlx::PgPool::connect(&url).await?;
    let store = procflow_core::store_postgres::PostgresStore::new(pool);
    store.migrate().await?;
    tracing::info!("postgres store ready, schema migrated");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn build_store(url: Option<String>) -> Result<Arc<dyn OrchStore>, BoxError> {
    if url.is_some() {
        tracing::warn!(
            "a database URL was given but this build lacks the postgres feature; \
             runs are kept in memory"
        );
    } else {
        tracing::info!("no database configured, keeping runs in memory");
    }
    Ok(Arc::new(MemoryStore::new()))
}
