//! The claim → download → dispatch → upload → update loop.
//!
//! One loop owns one job from claim to terminal state; parallelism comes
//! from running several loops, never from async work inside a handler.
//! Scratch space is a per-job `TempDir` whose drop guard covers every exit
//! path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::config::Settings;
use shared::db::{JobRepository, JobUpdate};
use shared::dto::{JobRecord, JobStatus};
use shared::storage::{processed_path, ArtifactStore, PROCESSED_BUCKET, RAW_BUCKET};

use crate::exec::truncate_message;
use crate::tools;

/// Longest error text persisted to a job row.
const ERROR_MESSAGE_LIMIT: usize = 500;
const SUCCESS_UPDATE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: String,
    pub repo: JobRepository,
    pub store: ArtifactStore,
    pub settings: Arc<Settings>,
}

/// Poll loop for one worker id; never returns.
pub async fn run_worker(ctx: WorkerContext) {
    info!(worker = %ctx.worker_id, "worker loop started");
    loop {
        match ctx.repo.claim_next(&ctx.worker_id).await {
            Ok(Some(job)) => process_job(&ctx, job).await,
            Ok(None) => tokio::time::sleep(ctx.settings.poll_interval()).await,
            Err(err) => {
                warn!(worker = %ctx.worker_id, error = %err, "claim failed, backing off");
                tokio::time::sleep(ctx.settings.poll_interval()).await;
            }
        }
    }
}

struct Completion {
    file_name: String,
    public_url: String,
    file_size: i64,
}

async fn process_job(ctx: &WorkerContext, job: JobRecord) {
    let job_id = job.id;
    info!(%job_id, tool = %job.tool_id, worker = %ctx.worker_id, "job claimed");

    match run_job_inner(ctx, &job).await {
        Ok(completion) => mark_succeeded(ctx, job_id, completion).await,
        Err(err) => {
            error!(%job_id, error = ?err, "job failed");
            mark_failed(ctx, job_id, &err).await;
        }
    }

    // Raw inputs are consumed either way; deletes are idempotent.
    for path in &job.input_file_paths {
        if let Err(err) = ctx.store.delete(RAW_BUCKET, path).await {
            warn!(%job_id, path = %path, error = %err, "raw input cleanup failed");
        }
    }
}

async fn run_job_inner(ctx: &WorkerContext, job: &JobRecord) -> anyhow::Result<Completion> {
    let scratch = tempfile::tempdir().context("creating scratch dir")?;

    report_progress(ctx, job.id, 10).await?;

    let total = job.input_file_paths.len().max(1);
    let mut local_inputs = Vec::with_capacity(job.input_file_paths.len());
    for (idx, path) in job.input_file_paths.iter().enumerate() {
        let base_name = path.rsplit('/').next().unwrap_or("input");
        let dest = scratch.path().join(format!("{idx:03}-{base_name}"));
        ctx.store
            .download_to(RAW_BUCKET, path, &dest)
            .await
            .with_context(|| format!("downloading input {}", idx + 1))?;
        local_inputs.push(dest);
        let progress = 10 + (10 * (idx + 1) / total) as i32;
        report_progress(ctx, job.id, progress).await?;
    }

    report_progress(ctx, job.id, 20).await?;
    let output = tools::dispatch(
        job.tool_id,
        &local_inputs,
        &job.options,
        scratch.path(),
        &ctx.settings,
    )
    .await?;
    report_progress(ctx, job.id, 80).await?;

    let file_name = tools::final_file_name(output.file_name_base, job.id, output.extension);
    let file_size = output.bytes.len() as i64;
    let public_url = ctx
        .store
        .upload(
            PROCESSED_BUCKET,
            &processed_path(job.id, &file_name),
            output.bytes,
            output.mime_type,
        )
        .await
        .context("uploading result")?;

    Ok(Completion {
        file_name,
        public_url,
        file_size,
    })
}

async fn report_progress(ctx: &WorkerContext, job_id: Uuid, progress: i32) -> anyhow::Result<()> {
    ctx.repo
        .update_progress(
            job_id,
            JobUpdate {
                status: JobStatus::InProgress,
                progress,
                ..JobUpdate::default()
            },
        )
        .await
        .with_context(|| format!("reporting progress {progress}"))?;
    Ok(())
}

/// The upload path is deterministic from the job id, so repeating the
/// success update after a transient failure is safe.
async fn mark_succeeded(ctx: &WorkerContext, job_id: Uuid, completion: Completion) {
    let update = JobUpdate {
        status: JobStatus::Succeeded,
        progress: 100,
        file_name: Some(completion.file_name),
        public_url: Some(completion.public_url),
        file_size: Some(completion.file_size),
        error_message: None,
    };
    for attempt in 1..=SUCCESS_UPDATE_ATTEMPTS {
        match ctx.repo.update_progress(job_id, update.clone()).await {
            Ok(()) => {
                info!(%job_id, size = update.file_size, "job succeeded");
                return;
            }
            Err(err) if attempt < SUCCESS_UPDATE_ATTEMPTS => {
                warn!(%job_id, attempt, error = %err, "success update failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(err) => {
                error!(%job_id, error = %err, "success update failed permanently; sweeper reclaims the artifact");
            }
        }
    }
}

async fn mark_failed(ctx: &WorkerContext, job_id: Uuid, err: &anyhow::Error) {
    let update = JobUpdate {
        status: JobStatus::Failed,
        progress: 0,
        error_message: Some(failure_message(err)),
        ..JobUpdate::default()
    };
    if let Err(update_err) = ctx.repo.update_progress(job_id, update).await {
        error!(%job_id, error = %update_err, "failure update could not be stored");
    }
}

/// Single-line error chain, bounded so noisy tool output cannot bloat the
/// job row. Handlers already keep credentials out of their messages.
fn failure_message(err: &anyhow::Error) -> String {
    truncate_message(&format!("{err:#}"), ERROR_MESSAGE_LIMIT)
}
