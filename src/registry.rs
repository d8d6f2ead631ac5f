use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{JobError, JobResult},
    models::{Artifact, Job, JobErrorPayload, JobStatus, MediaFormat},
};

#[derive(Debug)]
struct JobRecord {
    job: Job,
    // Set by `list_expirable`; a claimed job can no longer be served.
    claimed: bool,
    readers: Arc<AtomicUsize>,
}

/// Keeps an artifact alive while its bytes are being streamed.
#[derive(Debug)]
pub struct ServeLease {
    readers: Arc<AtomicUsize>,
}

impl Drop for ServeLease {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared in-memory store of download jobs.
///
/// Every mutation happens under one write lock, which is plenty for the
/// request volume a personal download shortcut produces.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, source_url: String, format: Option<MediaFormat>) -> String {
        let job_id = Uuid::new_v4().to_string();
        let record = JobRecord {
            job: Job::new(job_id.clone(), source_url, format),
            claimed: false,
            readers: Arc::new(AtomicUsize::new(0)),
        };
        self.jobs.write().await.insert(job_id.clone(), record);
        debug!(job_id = %job_id, "Job created");
        job_id
    }

    pub async fn get(&self, job_id: &str) -> JobResult<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id)
            .map(|record| record.job.clone())
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn mark_running(&self, job_id: &str) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        let record = transition(&mut jobs, job_id, JobStatus::Running)?;
        record.job.updated_at = Utc::now();
        Ok(())
    }

    /// Completes the job and hands back a lease in the same critical
    /// section, so no sweep can slip in before the first reader. Dropping
    /// the lease right away leaves the artifact to the retention window.
    pub async fn mark_completed(
        &self,
        job_id: &str,
        artifact: Artifact,
        size_bytes: u64,
    ) -> JobResult<(Job, ServeLease)> {
        let mut jobs = self.jobs.write().await;
        let artifact_conflict = jobs.values().find(|other| {
            other.job.id != job_id && other.job.file_path.as_ref() == Some(&artifact.path)
        });
        if let Some(owner) = artifact_conflict {
            return Err(JobError::ArtifactConflict {
                path: artifact.path,
                owner: owner.job.id.clone(),
            });
        }

        let record = transition(&mut jobs, job_id, JobStatus::Completed)?;
        record.job.updated_at = Utc::now();
        record.job.file_path = Some(artifact.path);
        record.job.title = artifact.title;
        record.job.size_bytes = Some(size_bytes);
        record.job.error = None;
        Ok((record.job.clone(), lease(record)))
    }

    pub async fn mark_failed(&self, job_id: &str, error: JobErrorPayload) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        let record = transition(&mut jobs, job_id, JobStatus::Failed)?;
        record.job.updated_at = Utc::now();
        record.job.file_path = None;
        record.job.error = Some(error);
        Ok(())
    }

    /// Claims and returns every settled job created before `older_than`.
    ///
    /// Claimed jobs are skipped by later calls until they are expired or
    /// released, and jobs with an open [`ServeLease`] are left alone.
    pub async fn list_expirable(&self, older_than: DateTime<Utc>) -> Vec<Job> {
        let mut jobs = self.jobs.write().await;
        let mut expirable: Vec<Job> = jobs
            .values_mut()
            .filter(|record| {
                record.job.status.is_settled()
                    && record.job.created_at < older_than
                    && !record.claimed
                    && record.readers.load(Ordering::Acquire) == 0
            })
            .map(|record| {
                record.claimed = true;
                record.job.clone()
            })
            .collect();
        expirable.sort_by_key(|job| job.created_at);
        expirable
    }

    /// Gives a claimed job back so a later sweep can retry it.
    pub async fn release(&self, job_id: &str) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        record.claimed = false;
        Ok(())
    }

    pub async fn expire(&self, job_id: &str) -> JobResult<()> {
        self.expire_at(job_id, Utc::now()).await
    }

    /// Same as [`Self::expire`] but records `at` as the expiry time.
    pub async fn expire_at(&self, job_id: &str, at: DateTime<Utc>) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        if matches!(record.job.status, JobStatus::Expired) {
            return Ok(());
        }

        let record = transition(&mut jobs, job_id, JobStatus::Expired)?;
        record.job.updated_at = Utc::now();
        record.job.expired_at = Some(at);
        record.job.file_path = None;
        record.claimed = false;
        info!(job_id = %job_id, "Job expired");
        Ok(())
    }

    /// Drops expired entries whose expiry happened before `before`.
    pub async fn purge_expired(&self, before: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let initial = jobs.len();
        jobs.retain(|_, record| {
            !(matches!(record.job.status, JobStatus::Expired)
                && record.job.expired_at.is_some_and(|at| at < before))
        });
        initial - jobs.len()
    }

    /// Registers a reader of a completed artifact.
    pub async fn open_lease(&self, job_id: &str) -> JobResult<(Job, ServeLease)> {
        let jobs = self.jobs.read().await;
        let record = jobs
            .get(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        match record.job.status {
            JobStatus::Completed if !record.claimed => {}
            // Being swept right now; treat it as gone.
            JobStatus::Completed | JobStatus::Expired => {
                return Err(JobError::NotFound(job_id.to_string()))
            }
            status => {
                return Err(JobError::NotReady {
                    job_id: job_id.to_string(),
                    status,
                })
            }
        }

        Ok((record.job.clone(), lease(record)))
    }
}

// Callers hold the registry lock, so `list_expirable` never misses a reader.
fn lease(record: &JobRecord) -> ServeLease {
    record.readers.fetch_add(1, Ordering::AcqRel);
    ServeLease {
        readers: record.readers.clone(),
    }
}

fn transition<'a>(
    jobs: &'a mut HashMap<String, JobRecord>,
    job_id: &str,
    next: JobStatus,
) -> JobResult<&'a mut JobRecord> {
    let record = jobs
        .get_mut(job_id)
        .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

    if !record.job.status.can_transition_to(next) {
        return Err(JobError::InvalidTransition {
            job_id: job_id.to_string(),
            from: record.job.status,
            to: next,
        });
    }

    record.job.status = next;
    Ok(record)
}
