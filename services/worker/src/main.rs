//! Worker fleet entry point: starts the configured number of claim loops
//! plus the retention sweeper against the shared job table.

mod compress;
mod convert;
mod exec;
mod pdfops;
mod runner;
mod security;
mod sweeper;
mod tools;

use std::str::FromStr;
use std::sync::Arc;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use shared::config::{ensure_sslmode_disable, Settings};
use shared::db::JobRepository;
use shared::storage::ArtifactStore;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).json().init();

    let settings = Arc::new(Settings::new().expect("configuration error"));
    let db_url = ensure_sslmode_disable(&settings.database_url);
    let pg_config = tokio_postgres::Config::from_str(&db_url).map_err(|err| {
        error!(error = %err, "failed to parse DATABASE_URL");
        anyhow::anyhow!("invalid database url")
    })?;
    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool: Pool = Pool::builder(manager)
        .max_size(16)
        .build()
        .map_err(|err| {
            error!(error = %err, "failed to build postgres pool");
            anyhow::anyhow!("db-pool")
        })?;

    let repo = JobRepository::new(pool);
    repo.ensure_schema()
        .await
        .map_err(|err| anyhow::anyhow!("failed to ensure schema: {err}"))?;

    let store = ArtifactStore::new(
        &settings.storage_url,
        &settings.storage_service_key,
        settings.storage_timeout(),
    )
    .map_err(|err| anyhow::anyhow!("artifact store client: {err}"))?;

    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".into());
    info!(workers = settings.worker_count, host = %host, "starting worker fleet");

    for _ in 0..settings.worker_count {
        let suffix = Uuid::new_v4().simple().to_string();
        let ctx = runner::WorkerContext {
            worker_id: format!("{host}-{}", &suffix[..8]),
            repo: repo.clone(),
            store: store.clone(),
            settings: settings.clone(),
        };
        tokio::spawn(runner::run_worker(ctx));
    }

    tokio::spawn(sweeper::run_sweeper(
        repo.clone(),
        store.clone(),
        settings.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}
