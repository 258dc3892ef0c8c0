//! Retention sweeper: one long-running task per worker process that
//! removes terminal jobs older than the retention window, artifact before
//! row. Multiple processes may sweep concurrently; every delete involved
//! is idempotent.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use shared::config::Settings;
use shared::db::JobRepository;
use shared::dto::JobRecord;
use shared::storage::{processed_path, ArtifactStore, PROCESSED_BUCKET, RAW_BUCKET};

pub async fn run_sweeper(repo: JobRepository, store: ArtifactStore, settings: Arc<Settings>) {
    let mut ticker = tokio::time::interval(settings.cleanup_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        retention_secs = settings.retention_secs,
        interval_secs = settings.cleanup_interval_secs,
        "retention sweeper started"
    );
    loop {
        ticker.tick().await;
        match sweep_once(&repo, &store, settings.retention()).await {
            Ok(0) => {}
            Ok(swept) => info!(count = swept, "swept expired jobs"),
            Err(err) => warn!(error = %err, "sweep pass failed"),
        }
    }
}

/// One sweep pass; returns the number of fully removed jobs. A job whose
/// artifact cannot be deleted is left for the next pass so the row never
/// outlives its artifact reference in the wrong order.
pub async fn sweep_once(
    repo: &JobRepository,
    store: &ArtifactStore,
    retention: Duration,
) -> anyhow::Result<usize> {
    let expired = repo.sweep_terminal_older_than(retention).await?;
    let mut swept = 0usize;
    for job in expired {
        if let Err(err) = delete_artifacts(store, &job).await {
            warn!(job_id = %job.id, error = %err, "artifact delete failed, retrying next pass");
            continue;
        }
        repo.delete(job.id).await?;
        swept += 1;
    }
    Ok(swept)
}

async fn delete_artifacts(store: &ArtifactStore, job: &JobRecord) -> anyhow::Result<()> {
    if let Some(file_name) = &job.file_name {
        store
            .delete(PROCESSED_BUCKET, &processed_path(job.id, file_name))
            .await?;
    }
    // Leftover raw inputs from crashed workers; normally gone already.
    for path in &job.input_file_paths {
        if let Err(err) = store.delete(RAW_BUCKET, path).await {
            warn!(job_id = %job.id, path = %path, error = %err, "raw input delete failed");
        }
    }
    Ok(())
}
