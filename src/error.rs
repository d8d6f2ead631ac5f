use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::models::{JobErrorPayload, JobStatus};

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    BadRequest(String),

    #[error("extraction timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {job_id} is {status}, artifact not ready")]
    NotReady { job_id: String, status: JobStatus },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("artifact {} already belongs to job {owner}", .path.display())]
    ArtifactConflict { path: PathBuf, owner: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl JobError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Timeout { .. } => "EXTRACTION_TIMEOUT",
            Self::ExtractionFailed(_) => "EXTRACTION_FAILED",
            Self::NotFound(_) => "JOB_NOT_FOUND",
            Self::NotReady { .. } => "ARTIFACT_NOT_READY",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ArtifactConflict { .. } => "ARTIFACT_CONFLICT",
            Self::Io(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotReady { .. } => StatusCode::CONFLICT,
            Self::ExtractionFailed(_)
            | Self::InvalidTransition { .. }
            | Self::ArtifactConflict { .. }
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_payload(&self) -> JobErrorPayload {
        JobErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::InvalidTransition { .. } | Self::ArtifactConflict { .. }
        ) {
            error!("Registry consistency error: {self}");
        }

        (
            self.status_code(),
            Json(json!({
                "error": {
                    "code": self.code(),
                    "message": self.to_string()
                }
            })),
        )
            .into_response()
    }
}
