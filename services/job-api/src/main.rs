//! HTTP front of the document-processing job service: accepts multipart
//! tool submissions, exposes status polling, and gates proxied downloads
//! behind the access counter.

use std::str::FromStr;
use std::sync::Arc;

use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::http::header;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use futures_util::StreamExt as _;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use serde_json::{json, Value};
use tokio_postgres::NoTls;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::config::{ensure_sslmode_disable, Settings};
use shared::db::JobRepository;
use shared::dto::{
    file_size_mb, FileSizeResponse, StatusResponse, SubmitResponse, ToolId,
};
use shared::error::JobError;
use shared::options::validate_submission;
use shared::storage::{
    raw_input_path, ArtifactStore, PROCESSED_BUCKET, RAW_BUCKET,
};

#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    repo: JobRepository,
    store: ArtifactStore,
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(serde::Deserialize)]
struct JobIdQuery {
    #[serde(rename = "jobId")]
    job_id: Uuid,
}

#[derive(serde::Deserialize)]
struct FileIdQuery {
    #[serde(rename = "fileId")]
    file_id: Uuid,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Arc::new(Settings::new().expect("configuration error"));
    let db_url = ensure_sslmode_disable(&settings.database_url);
    let pg_config = tokio_postgres::Config::from_str(&db_url).map_err(|err| {
        error!(error = %err, "failed to parse DATABASE_URL");
        std::io::Error::other("invalid database url")
    })?;
    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool: Pool = Pool::builder(manager).max_size(16).build().map_err(|err| {
        error!(error = %err, "failed to build postgres pool");
        std::io::Error::other("db-pool")
    })?;

    let repo = JobRepository::new(pool);
    if let Err(err) = repo.ensure_schema().await {
        error!(error = %err, "failed to ensure schema");
        std::process::exit(1);
    }

    let store = ArtifactStore::new(
        &settings.storage_url,
        &settings.storage_service_key,
        settings.storage_timeout(),
    )
    .expect("artifact store client");

    let state = AppState {
        settings: settings.clone(),
        repo,
        store,
    };

    let bind_addr = format!("{}:{}", settings.http_bind, settings.http_port);
    info!(%bind_addr, "starting job api");

    HttpServer::new(move || {
        let app_state = state.clone();
        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST", "DELETE"])
            .allowed_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION])
            .max_age(3600);

        if let Some(origins) = app_state.settings.cors_origin_list() {
            for origin in &origins {
                cors = cors.allowed_origin(origin);
            }
        } else {
            warn!("CORS_ORIGINS not set; allowing any origin");
            cors = cors.allow_any_origin();
        }

        App::new()
            .app_data(web::Data::new(app_state))
            .wrap(Logger::default())
            .wrap(cors)
            .route("/healthz", web::get().to(healthz))
            .route("/process-pdf", web::post().to(submit_job))
            .route("/process-pdf", web::get().to(job_status))
            .route("/download-proxied-file", web::get().to(proxied_download))
            .route("/file-size", web::get().to(file_size))
            .route("/delete-processed-file", web::delete().to(delete_processed))
    })
    .bind(bind_addr)?
    .run()
    .await
}

async fn healthz() -> impl Responder {
    web::Json(HealthResponse { status: "ok" })
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "success": false, "error": message.into() }))
}

fn internal_error(err: &JobError) -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "success": false, "error": err.to_string() }))
}

/// Accepts a multipart submission (`toolId`, `files[]`, optional JSON
/// `options`), uploads the raw inputs, and enqueues a pending job.
/// Validation failures return 400 before anything is persisted.
async fn submit_job(
    mut payload: Multipart,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let max_bytes = state.settings.max_upload_bytes();
    let mut tool_raw: Option<String> = None;
    let mut options_raw: Option<String> = None;
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field_res) = payload.next().await {
        let mut field = field_res?;
        let field_name = field.name().to_string();
        match field_name.as_str() {
            "toolId" => tool_raw = Some(read_text_field(&mut field).await?),
            "options" => options_raw = Some(read_text_field(&mut field).await?),
            "files" | "files[]" => {
                let original = field
                    .content_disposition()
                    .get_filename()
                    .unwrap_or("upload.pdf")
                    .to_string();
                let mut bytes = Vec::new();
                while let Some(chunk) = field.next().await {
                    bytes.extend_from_slice(&chunk?);
                    if bytes.len() as u64 > max_bytes {
                        return Ok(bad_request(format!(
                            "file '{original}' exceeds the {} MB upload limit",
                            state.settings.max_upload_mb
                        )));
                    }
                }
                files.push((original, bytes));
            }
            _ => {
                // Unbekannte Felder leeren, sonst blockiert der Stream.
                while let Some(chunk) = field.next().await {
                    let _ = chunk?;
                }
            }
        }
    }

    let Some(tool_raw) = tool_raw else {
        return Ok(bad_request("toolId is required"));
    };
    let tool_id = match ToolId::from_str(&tool_raw) {
        Ok(tool) => tool,
        Err(_) => return Ok(bad_request(format!("unknown toolId '{tool_raw}'"))),
    };
    if files.is_empty() {
        return Ok(bad_request("at least one file is required"));
    }
    let options: Value = match options_raw.as_deref() {
        None | Some("") => json!({}),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => return Ok(bad_request(format!("options is not valid JSON: {err}"))),
        },
    };
    if let Err(err) = validate_submission(tool_id, files.len(), &options) {
        return Ok(bad_request(err.to_string()));
    }

    let job_id = Uuid::new_v4();
    let file_count = files.len();
    let mut input_paths = Vec::with_capacity(file_count);
    for (original, bytes) in files {
        let path = raw_input_path(job_id, &original);
        let content_type = infer::get(&bytes)
            .map(|kind| kind.mime_type())
            .unwrap_or("application/octet-stream");
        if let Err(err) = state
            .store
            .upload(RAW_BUCKET, &path, bytes, content_type)
            .await
        {
            error!(%job_id, error = %err, "raw input upload failed");
            return Ok(internal_error(&err));
        }
        input_paths.push(path);
    }

    if let Err(err) = state
        .repo
        .insert_pending(job_id, tool_id, &input_paths, &options)
        .await
    {
        error!(%job_id, error = %err, "failed to insert pending job");
        return Ok(internal_error(&err));
    }

    let (queue_position, estimated_wait) = match state.repo.queue_counts().await {
        Ok(counts) => (
            Some(counts.pending),
            Some(counts.pending.max(0) as u64 * state.settings.average_job_time_secs),
        ),
        Err(err) => {
            warn!(%job_id, error = %err, "queue estimate unavailable");
            (None, None)
        }
    };

    info!(%job_id, tool = %tool_id, inputs = file_count, "job submitted");
    Ok(HttpResponse::Accepted().json(SubmitResponse {
        success: true,
        job_id,
        status_check_link: format!("/process-pdf?jobId={job_id}"),
        queue_position,
        estimated_wait_time_seconds: estimated_wait,
    }))
}

async fn read_text_field(field: &mut actix_multipart::Field) -> actix_web::Result<String> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

/// Read-only projection of the job record for status polling.
async fn job_status(
    query: web::Query<JobIdQuery>,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    match state.repo.get(query.job_id).await {
        Ok(Some(record)) => Ok(HttpResponse::Ok().json(StatusResponse::from_record(&record))),
        Ok(None) => Ok(HttpResponse::NotFound().json(json!({ "error": "job not found" }))),
        Err(err) => {
            error!(job_id = %query.job_id, error = %err, "status lookup failed");
            Ok(internal_error(&err))
        }
    }
}

/// Streams the output artifact while enforcing the access cap: the bump is
/// atomic in the repository, and crossing the threshold deletes the
/// artifact before the row, then reports 410.
async fn proxied_download(
    query: web::Query<JobIdQuery>,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let job_id = query.job_id;
    let record = match state.repo.get(job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return Ok(HttpResponse::NotFound().json(json!({ "error": "job not found" })))
        }
        Err(err) => return Ok(internal_error(&err)),
    };
    let (Some(public_url), Some(file_name)) = (record.public_url, record.file_name) else {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "no output available" })));
    };

    let decision = match state
        .repo
        .increment_access(job_id, state.settings.access_threshold)
        .await
    {
        Ok(Some(decision)) => decision,
        Ok(None) => {
            return Ok(HttpResponse::NotFound().json(json!({ "error": "job not found" })))
        }
        Err(err) => return Ok(internal_error(&err)),
    };

    if decision.deleted {
        // Artefakt vor der Zeile löschen; beide Schritte sind idempotent.
        let path = shared::storage::processed_path(job_id, &file_name);
        if let Err(err) = state.store.delete(PROCESSED_BUCKET, &path).await {
            warn!(%job_id, error = %err, "artifact delete after access cap failed");
        }
        if let Err(err) = state.repo.delete(job_id).await {
            warn!(%job_id, error = %err, "row delete after access cap failed");
        }
        info!(%job_id, count = decision.access_count, "access cap reached, artifact removed");
        return Ok(HttpResponse::Gone().json(json!({ "error": "download limit reached" })));
    }

    let (bytes, content_type) = match state.store.fetch(&public_url).await {
        Ok(body) => body,
        Err(err) => {
            error!(%job_id, error = %err, "artifact fetch failed");
            return Ok(HttpResponse::Gone().json(json!({ "error": "artifact no longer available" })));
        }
    };
    let content_type = content_type.unwrap_or_else(|| content_type_for(&file_name).to_string());

    info!(%job_id, count = decision.access_count, "proxied download served");
    Ok(HttpResponse::Ok()
        .content_type(content_type)
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        ))
        .body(bytes))
}

/// Output size in megabytes, rounded to two decimals.
async fn file_size(
    query: web::Query<FileIdQuery>,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    match state.repo.get(query.file_id).await {
        Ok(Some(record)) => match record.file_size {
            Some(bytes) => Ok(HttpResponse::Ok().json(FileSizeResponse {
                file_size_mb: file_size_mb(bytes),
            })),
            None => Ok(HttpResponse::NotFound().json(json!({ "error": "no output available" }))),
        },
        Ok(None) => Ok(HttpResponse::NotFound().json(json!({ "error": "job not found" }))),
        Err(err) => Ok(internal_error(&err)),
    }
}

/// Deletes the output artifact, any remaining raw inputs, and the job row.
/// Succeeds when nothing is left to delete.
async fn delete_processed(
    query: web::Query<JobIdQuery>,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let job_id = query.job_id;
    match state.repo.get(job_id).await {
        Ok(Some(record)) => {
            if let Some(file_name) = &record.file_name {
                let path = shared::storage::processed_path(job_id, file_name);
                if let Err(err) = state.store.delete(PROCESSED_BUCKET, &path).await {
                    warn!(%job_id, error = %err, "artifact delete failed");
                    return Ok(internal_error(&err));
                }
            }
            for path in &record.input_file_paths {
                if let Err(err) = state.store.delete(RAW_BUCKET, path).await {
                    warn!(%job_id, error = %err, path = %path, "raw input delete failed");
                }
            }
            if let Err(err) = state.repo.delete(job_id).await {
                return Ok(internal_error(&err));
            }
            info!(%job_id, "job deleted on request");
        }
        Ok(None) => {}
        Err(err) => return Ok(internal_error(&err)),
    }
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

/// Fallback content type for attachment responses when the store does not
/// report one.
fn content_type_for(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next().map(str::to_ascii_lowercase) {
        Some(ext) if ext == "pdf" => "application/pdf",
        Some(ext) if ext == "zip" => "application/zip",
        Some(ext) if ext == "docx" => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some(ext) if ext == "png" => "image/png",
        _ => "application/octet-stream",
    }
}
