use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{artifact_store::delete_file_if_exists, config::Config, registry::JobRegistry};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
    pub purged: usize,
}

/// Periodically deletes artifacts past the retention window.
#[derive(Debug, Clone)]
pub struct ExpirySweeper {
    registry: Arc<JobRegistry>,
    retention: Duration,
    interval: Duration,
    expired_grace: Duration,
}

pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            warn!("Sweeper task ended abnormally: {err}");
        }
    }
}

impl ExpirySweeper {
    pub fn new(
        registry: Arc<JobRegistry>,
        retention: Duration,
        interval: Duration,
        expired_grace: Duration,
    ) -> Self {
        Self {
            registry,
            retention,
            interval,
            expired_grace,
        }
    }

    pub fn from_config(registry: Arc<JobRegistry>, config: &Config) -> Self {
        Self::new(
            registry,
            config.retention(),
            config.sweep_interval(),
            config.expired_grace(),
        )
    }

    pub fn start(self) -> SweeperHandle {
        let token = CancellationToken::new();
        let stop = token.clone();
        let task = tokio::spawn(async move {
            info!(
                retention_secs = self.retention.as_secs(),
                interval_secs = self.interval.as_secs(),
                "Expiry sweeper started"
            );
            let mut interval = time::interval(self.interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
            info!("Expiry sweeper stopped");
        });
        SweeperHandle { token, task }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = before(now, self.retention);

        for job in self.registry.list_expirable(cutoff).await {
            if let Some(path) = &job.file_path {
                if let Err(err) = delete_file_if_exists(path).await {
                    warn!(job_id = %job.id, "Failed to delete expired artifact: {err:#}");
                    report.failed += 1;
                    if let Err(err) = self.registry.release(&job.id).await {
                        warn!(job_id = %job.id, "Failed to release sweep claim: {err}");
                    }
                    continue;
                }
            }

            match self.registry.expire_at(&job.id, now).await {
                Ok(()) => report.expired += 1,
                Err(err) => {
                    warn!(job_id = %job.id, "Failed to expire job: {err}");
                    report.failed += 1;
                }
            }
        }

        report.purged = self
            .registry
            .purge_expired(before(now, self.expired_grace))
            .await;

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                failed = report.failed,
                purged = report.purged,
                "Sweep finished"
            );
        }
        report
    }
}

fn before(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(span)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        error::JobError,
        models::{Artifact, JobErrorPayload, JobStatus},
    };

    const MINUTE: Duration = Duration::from_secs(60);

    fn sweeper(registry: &Arc<JobRegistry>) -> ExpirySweeper {
        ExpirySweeper::new(registry.clone(), 30 * MINUTE, 5 * MINUTE, 60 * MINUTE)
    }

    async fn completed_with_file(registry: &JobRegistry, path: &Path) -> String {
        std::fs::write(path, b"media").expect("write artifact");
        let id = registry
            .create("https://example.com/video1".into(), None)
            .await;
        registry.mark_running(&id).await.expect("running");
        registry
            .mark_completed(
                &id,
                Artifact {
                    path: path.to_path_buf(),
                    title: None,
                },
                5,
            )
            .await
            .expect("completed");
        id
    }

    #[tokio::test]
    async fn old_artifacts_are_deleted_and_jobs_expired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(JobRegistry::new());
        let path = dir.path().join("old.mp4");
        let id = completed_with_file(&registry, &path).await;

        // Two hours later with a 30 minute retention window.
        let report = sweeper(&registry)
            .sweep_at(Utc::now() + ChronoDuration::hours(2))
            .await;

        assert_eq!(report.expired, 1);
        assert!(!path.exists());
        let job = registry.get(&id).await.expect("still tracked during grace");
        assert_eq!(job.status, JobStatus::Expired);
        assert!(job.file_path.is_none());
        assert!(matches!(
            registry.open_lease(&id).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fresh_artifacts_survive_a_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(JobRegistry::new());
        let path = dir.path().join("fresh.mp4");
        let id = completed_with_file(&registry, &path).await;

        let report = sweeper(&registry).sweep_once().await;

        assert_eq!(report, SweepReport::default());
        assert!(path.exists());
        assert_eq!(
            registry.get(&id).await.expect("job").status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn running_jobs_and_their_files_are_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(JobRegistry::new());
        let in_progress = dir.path().join("busy.mp4.part");
        std::fs::write(&in_progress, b"half").expect("write");
        let id = registry.create("https://example.com/v".into(), None).await;
        registry.mark_running(&id).await.expect("running");

        let report = sweeper(&registry)
            .sweep_at(Utc::now() + ChronoDuration::hours(2))
            .await;

        assert_eq!(report.expired, 0);
        assert!(in_progress.exists());
        assert_eq!(registry.get(&id).await.expect("job").status, JobStatus::Running);
    }

    #[tokio::test]
    async fn failed_jobs_expire_without_files() {
        let registry = Arc::new(JobRegistry::new());
        let id = registry.create("https://example.com/v".into(), None).await;
        registry.mark_running(&id).await.expect("running");
        registry
            .mark_failed(
                &id,
                JobErrorPayload {
                    code: "EXTRACTION_TIMEOUT".into(),
                    message: "too slow".into(),
                },
            )
            .await
            .expect("failed");

        let report = sweeper(&registry)
            .sweep_at(Utc::now() + ChronoDuration::hours(2))
            .await;
        assert_eq!(report.expired, 1);
        assert_eq!(registry.get(&id).await.expect("job").status, JobStatus::Expired);
    }

    #[tokio::test]
    async fn one_deletion_failure_does_not_stop_the_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(JobRegistry::new());

        // A directory cannot be removed with remove_file.
        let stubborn = dir.path().join("stubborn.mp4");
        std::fs::create_dir(&stubborn).expect("mkdir");
        let stuck = registry.create("https://example.com/a".into(), None).await;
        registry.mark_running(&stuck).await.expect("running");
        registry
            .mark_completed(
                &stuck,
                Artifact {
                    path: stubborn.clone(),
                    title: None,
                },
                0,
            )
            .await
            .expect("completed");

        let ok_path = dir.path().join("ok.mp4");
        let ok = completed_with_file(&registry, &ok_path).await;

        let later = Utc::now() + ChronoDuration::hours(2);
        let report = sweeper(&registry).sweep_at(later).await;

        assert_eq!(report.expired, 1);
        assert_eq!(report.failed, 1);
        assert!(!ok_path.exists());
        assert_eq!(registry.get(&ok).await.expect("job").status, JobStatus::Expired);

        let stuck_job = registry.get(&stuck).await.expect("job");
        assert_eq!(stuck_job.status, JobStatus::Completed);
        assert_eq!(stuck_job.file_path, Some(stubborn));

        // Claim was released, so the next sweep retries it.
        let retry = sweeper(&registry).sweep_at(later).await;
        assert_eq!(retry.failed, 1);
    }

    #[tokio::test]
    async fn artifacts_being_served_are_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(JobRegistry::new());
        let path = dir.path().join("streaming.mp4");
        let id = completed_with_file(&registry, &path).await;

        let (_, lease) = registry.open_lease(&id).await.expect("lease");
        let later = Utc::now() + ChronoDuration::hours(2);
        assert_eq!(sweeper(&registry).sweep_at(later).await.expired, 0);
        assert!(path.exists());

        drop(lease);
        assert_eq!(sweeper(&registry).sweep_at(later).await.expired, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn expired_entries_are_purged_after_grace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(JobRegistry::new());
        let id = completed_with_file(&registry, &dir.path().join("a.mp4")).await;

        sweeper(&registry)
            .sweep_at(Utc::now() + ChronoDuration::hours(2))
            .await;
        assert!(registry.get(&id).await.is_ok());

        let report = sweeper(&registry)
            .sweep_at(Utc::now() + ChronoDuration::hours(4))
            .await;
        assert_eq!(report.purged, 1);
        assert!(matches!(registry.get(&id).await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn started_sweeper_runs_and_stops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(JobRegistry::new());
        let path = dir.path().join("quick.mp4");
        let id = completed_with_file(&registry, &path).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = ExpirySweeper::new(
            registry.clone(),
            Duration::from_millis(1),
            Duration::from_millis(10),
            60 * MINUTE,
        )
        .start();

        let expired = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if registry.get(&id).await.map(|job| job.status).ok() == Some(JobStatus::Expired) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(expired.is_ok(), "sweeper should expire the job");
        assert!(!path.exists());

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("sweeper stops promptly");
    }
}
