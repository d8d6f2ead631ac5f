use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::fs::{self, File};
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use url::Url;

use crate::{
    artifact_store::{content_disposition, delete_file_if_exists, download_file_name},
    error::{JobError, JobResult},
    models::{Job, JobResponse, MediaFormat},
    registry::ServeLease,
    AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub format: Option<String>,
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "jobs": state.registry.len().await
    }))
}

/// `GET /download?url=..&format=..`: extract, then stream the file back.
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> JobResult<Response<Body>> {
    let (source_url, format) = parse_download_query(&query)?;

    let job_id = state.registry.create(source_url.clone(), format).await;
    info!(
        job_id = %job_id,
        url = %source_url,
        format = format.unwrap_or_default().as_str(),
        "Download requested"
    );

    // Extraction outlives the request: a client that hangs up still leaves a
    // settled job behind for the sweeper.
    let worker_state = state.clone();
    let worker_job_id = job_id.clone();
    let worker = tokio::spawn(async move { run_job(&worker_state, &worker_job_id).await });

    let (job, lease) = worker
        .await
        .map_err(|err| JobError::Internal(format!("Extraction task failed: {err}")))??;

    stream_artifact(&state, job, lease).await
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> JobResult<Json<JobResponse>> {
    let job = state.registry.get(&job_id).await?;
    Ok(Json(job.to_response()))
}

pub async fn download_job_file(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> JobResult<Response<Body>> {
    serve_artifact(&state, &job_id).await
}

fn parse_download_query(query: &DownloadQuery) -> JobResult<(String, Option<MediaFormat>)> {
    let raw = query.url.as_deref().map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(JobError::BadRequest("URL parameter is required".to_string()));
    }

    let parsed =
        Url::parse(raw).map_err(|err| JobError::BadRequest(format!("Invalid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(JobError::BadRequest(
            "URL must be an absolute http(s) address".to_string(),
        ));
    }

    let format = query
        .format
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::parse::<MediaFormat>)
        .transpose()
        .map_err(JobError::BadRequest)?;

    Ok((raw.to_string(), format))
}

/// Drives one job from Pending to Completed or Failed.
///
/// A completed job comes back already leased, so the requester can stream
/// it before any sweep gets a look.
pub async fn run_job(state: &AppState, job_id: &str) -> JobResult<(Job, ServeLease)> {
    state.registry.mark_running(job_id).await?;
    let job = state.registry.get(job_id).await?;

    let outcome = async {
        let artifact = state
            .extractor
            .fetch(
                job_id,
                &job.source_url,
                job.media_format(),
                &state.config.download_dir,
            )
            .await?;
        let size_bytes = fs::metadata(&artifact.path).await?.len();
        Ok::<_, JobError>((artifact, size_bytes))
    }
    .await;

    let err = match outcome {
        Ok((artifact, size_bytes)) => {
            let path = artifact.path.clone();
            match state
                .registry
                .mark_completed(job_id, artifact, size_bytes)
                .await
            {
                Ok(leased) => {
                    info!(
                        job_id = %job_id,
                        artifact = %path.display(),
                        size_bytes,
                        "Download completed"
                    );
                    return Ok(leased);
                }
                Err(err) => {
                    // A conflicting path belongs to someone else; leave it alone.
                    if !matches!(err, JobError::ArtifactConflict { .. }) {
                        if let Err(cleanup_err) = delete_file_if_exists(&path).await {
                            warn!(job_id = %job_id, "Failed to drop untracked artifact: {cleanup_err:#}");
                        }
                    }
                    err
                }
            }
        }
        Err(err) => err,
    };

    if let Err(mark_err) = state.registry.mark_failed(job_id, err.to_payload()).await {
        warn!(job_id = %job_id, "Failed to record job failure: {mark_err}");
    }
    Err(err)
}

async fn serve_artifact(state: &AppState, job_id: &str) -> JobResult<Response<Body>> {
    let (job, lease) = state.registry.open_lease(job_id).await?;
    stream_artifact(state, job, lease).await
}

async fn stream_artifact(
    state: &AppState,
    job: Job,
    lease: ServeLease,
) -> JobResult<Response<Body>> {
    let job_id = job.id.as_str();
    let path = job
        .file_path
        .clone()
        .ok_or_else(|| JobError::Internal(format!("Job {job_id} has no artifact path")))?;

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(JobError::Internal(format!(
                "Artifact for job {job_id} is missing on disk"
            )));
        }
        Err(err) => return Err(err.into()),
    };
    let size_bytes = file.metadata().await?.len();

    let format = job.media_format();
    let file_name = download_file_name(
        job.title.as_deref(),
        &path,
        format,
        state.config.max_filename_length,
    );
    let (disposition, encoded_name) = content_disposition(&file_name);

    // The lease rides along with the body so the sweeper waits for the transfer.
    let body = ReaderStream::new(file).map(move |chunk| {
        let _reading = &lease;
        chunk
    });

    info!(job_id = %job_id, file_name = %file_name, size_bytes, "Serving artifact");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size_bytes)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header("X-Filename", encoded_name)
        .header("X-File-Type", format.as_str())
        .header("X-Job-Id", job_id)
        .body(Body::from_stream(body))
        .map_err(|err| JobError::Internal(format!("Failed to build download response: {err}")))
}
