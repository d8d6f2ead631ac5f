use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Completed, Self::Expired)
                | (Self::Failed, Self::Expired)
        )
    }

    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller wants out of the source page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    #[default]
    Video,
    Audio,
}

impl MediaFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    /// Format selector handed to yt-dlp.
    pub fn selector(&self) -> &'static str {
        match self {
            Self::Video => "best",
            Self::Audio => "bestaudio",
        }
    }
}

impl FromStr for MediaFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            other => Err(format!("Invalid format type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorPayload {
    pub code: String,
    pub message: String,
}

/// File produced by the extraction tool for a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source_url: String,
    pub format: Option<MediaFormat>,
    pub status: JobStatus,
    pub file_path: Option<PathBuf>,
    pub title: Option<String>,
    pub size_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub error: Option<JobErrorPayload>,
}

impl Job {
    pub fn new(id: String, source_url: String, format: Option<MediaFormat>) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_url,
            format,
            status: JobStatus::Pending,
            file_path: None,
            title: None,
            size_bytes: None,
            created_at: now,
            updated_at: now,
            expired_at: None,
            error: None,
        }
    }

    pub fn media_format(&self) -> MediaFormat {
        self.format.unwrap_or_default()
    }

    pub fn to_response(&self) -> JobResponse {
        JobResponse {
            job_id: self.id.clone(),
            source_url: self.source_url.clone(),
            format: self.media_format(),
            status: self.status,
            title: self.title.clone(),
            size_bytes: self.size_bytes,
            download_url: matches!(self.status, JobStatus::Completed)
                .then(|| format!("/jobs/{}/file", self.id)),
            created_at: self.created_at,
            updated_at: self.updated_at,
            expired_at: self.expired_at,
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: String,
    pub source_url: String,
    pub format: MediaFormat,
    pub status: JobStatus,
    pub title: Option<String>,
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub error: Option<JobErrorPayload>,
}
