use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{fs, process::Command};
use tracing::{debug, info, warn};

use crate::{
    artifact_store::{find_job_files, is_job_file, job_output_template, remove_job_files},
    config::Config,
    error::{JobError, JobResult},
    models::{Artifact, MediaFormat},
};

const STDERR_EXCERPT_CHARS: usize = 2000;

/// Produces one media file for a job inside `destination_dir`.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn fetch(
        &self,
        job_id: &str,
        source_url: &str,
        format: MediaFormat,
        destination_dir: &Path,
    ) -> JobResult<Artifact>;
}

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: PathBuf,
    timeout: Duration,
    ca_cert_path: Option<PathBuf>,
}

impl YtDlpExtractor {
    pub fn new(binary: PathBuf, timeout: Duration, ca_cert_path: Option<PathBuf>) -> Self {
        Self {
            binary,
            timeout,
            ca_cert_path,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let extractor = Self::new(
            config.ytdlp_bin.clone(),
            config.extract_timeout(),
            config.ca_cert_path.clone(),
        );
        if extractor.usable_ca_cert().is_none() {
            warn!("No usable CA certificate configured, yt-dlp will skip certificate verification");
        }
        extractor
    }

    fn usable_ca_cert(&self) -> Option<&Path> {
        self.ca_cert_path.as_deref().filter(|path| path.is_file())
    }

    fn build_command(
        &self,
        job_id: &str,
        source_url: &str,
        format: MediaFormat,
        destination_dir: &Path,
    ) -> Command {
        let template = job_output_template(destination_dir, job_id);

        let mut command = Command::new(&self.binary);
        command
            .arg("--no-playlist")
            .arg("--no-progress")
            .arg("--no-simulate")
            .arg("--print")
            .arg("title")
            .arg("--print")
            .arg("after_move:filepath")
            .arg("-f")
            .arg(format.selector())
            .arg("-o")
            .arg(&template);

        if matches!(format, MediaFormat::Audio) {
            command.arg("-x").arg("--audio-format").arg("m4a");
        }

        match self.usable_ca_cert() {
            Some(ca_cert) => {
                debug!(ca_cert = %ca_cert.display(), "Using custom CA certificate");
                command
                    .env("SSL_CERT_FILE", ca_cert)
                    .env("REQUESTS_CA_BUNDLE", ca_cert);
            }
            None => {
                debug!(job_id = %job_id, "Skipping certificate verification");
                command.arg("--no-check-certificates");
            }
        }

        command
            .arg("--")
            .arg(source_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can also reach ffmpeg and other helpers.
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    async fn run(
        &self,
        job_id: &str,
        source_url: &str,
        format: MediaFormat,
        destination_dir: &Path,
    ) -> JobResult<Artifact> {
        let mut command = self.build_command(job_id, source_url, format, destination_dir);
        let child = command.spawn().map_err(|err| {
            JobError::ExtractionFailed(format!(
                "Failed to execute {}: {err}",
                self.binary.display()
            ))
        })?;
        let pid = child.id();

        // Dropping the future on timeout kills the direct child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| {
                JobError::ExtractionFailed(format!(
                    "Failed to wait for {}: {err}",
                    self.binary.display()
                ))
            })?,
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                return Err(JobError::Timeout {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(job_id = %job_id, stderr = %excerpt(&stderr), "yt-dlp diagnostics");
        }

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                format!("yt-dlp exited with {}", output.status)
            } else {
                excerpt(&stderr)
            };
            return Err(JobError::ExtractionFailed(detail));
        }

        let (title, printed_path) = parse_printed_output(&stdout);
        let path = match printed_path {
            Some(path) => resolve_printed_path(&path, destination_dir, job_id).await?,
            None => locate_artifact(destination_dir, job_id).await?,
        };

        Ok(Artifact { path, title })
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn fetch(
        &self,
        job_id: &str,
        source_url: &str,
        format: MediaFormat,
        destination_dir: &Path,
    ) -> JobResult<Artifact> {
        info!(job_id = %job_id, url = %source_url, format = format.as_str(), "Starting extraction");

        // yt-dlp echoes the template back, so hand it an absolute one.
        let destination_dir = fs::canonicalize(destination_dir).await?;
        let destination_dir = destination_dir.as_path();
        let result = self.run(job_id, source_url, format, destination_dir).await;

        let result = match result {
            // Anything besides the artifact is leftover from format merging.
            Ok(artifact) => {
                let pruned = prune_siblings(destination_dir, job_id, &artifact.path).await;
                pruned.map(|()| artifact)
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            match remove_job_files(destination_dir, job_id).await {
                Ok(0) => {}
                Ok(removed) => info!(job_id = %job_id, removed, "Removed partial download files"),
                Err(cleanup_err) => {
                    warn!(job_id = %job_id, "Failed to clean partial files: {cleanup_err:#}")
                }
            }
            warn!(job_id = %job_id, "Extraction failed: {err}");
        }

        result
    }
}

/// First non-empty line is the title, last one the final file path.
fn parse_printed_output(stdout: &str) -> (Option<String>, Option<String>) {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    match lines.as_slice() {
        [] => (None, None),
        [only] => (None, Some(only.to_string())),
        [first, .., last] => (Some(first.to_string()), Some(last.to_string())),
    }
}

/// Relative paths are taken as yt-dlp reports them: against the working
/// directory it inherited from this process.
async fn resolve_printed_path(
    printed: &str,
    destination_dir: &Path,
    job_id: &str,
) -> JobResult<PathBuf> {
    let candidate = PathBuf::from(printed);

    let root = fs::canonicalize(destination_dir).await?;
    let path = fs::canonicalize(&candidate).await.map_err(|_| {
        JobError::ExtractionFailed(format!(
            "yt-dlp reported {} but no such file exists",
            candidate.display()
        ))
    })?;

    if path.parent() != Some(root.as_path()) || !is_job_file(&path, job_id) {
        return Err(JobError::ExtractionFailed(format!(
            "yt-dlp wrote {} outside the job's artifact slot",
            path.display()
        )));
    }
    Ok(path)
}

async fn locate_artifact(destination_dir: &Path, job_id: &str) -> JobResult<PathBuf> {
    let files = find_job_files(destination_dir, job_id).await?;
    let mut complete = files.into_iter().filter(|path| {
        !matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("part" | "ytdl" | "temp")
        )
    });

    match (complete.next(), complete.next()) {
        (Some(path), None) => Ok(fs::canonicalize(&path).await?),
        (None, _) => Err(JobError::ExtractionFailed(
            "Download finished but no file was produced".to_string(),
        )),
        (Some(_), Some(_)) => Err(JobError::ExtractionFailed(
            "Download produced more than one file".to_string(),
        )),
    }
}

async fn prune_siblings(destination_dir: &Path, job_id: &str, keep: &Path) -> JobResult<()> {
    for path in find_job_files(destination_dir, job_id).await? {
        let path = match fs::canonicalize(&path).await {
            Ok(resolved) => resolved,
            Err(_) => path,
        };
        if path != keep {
            fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, "Process group already gone: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_EXCERPT_CHARS).collect()
}
