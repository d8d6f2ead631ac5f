use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_RETENTION_SECONDS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 5 * 60;
const DEFAULT_EXPIRED_GRACE_SECONDS: u64 = 60 * 60;
// iOS shortcut gives up after 300s, so the tool gets the same budget.
const DEFAULT_EXTRACT_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_MAX_FILENAME_LENGTH: usize = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub download_dir: PathBuf,
    pub retention_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub expired_grace_seconds: u64,
    pub extract_timeout_seconds: u64,
    pub ytdlp_bin: PathBuf,
    pub ca_cert_path: Option<PathBuf>,
    pub max_filename_length: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = lookup("PORT")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let bind_addr = lookup("VIDEO_API_BIND_ADDR")
            .map(|raw| {
                raw.trim()
                    .trim_matches('"')
                    .trim_matches('\'')
                    .to_string()
            })
            .and_then(|v| v.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], port)));

        let download_dir = lookup("DOWNLOAD_DIR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("video_downloader"));

        let seconds = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        let extract_timeout_seconds = seconds(
            "VIDEO_API_EXTRACT_TIMEOUT_SECONDS",
            DEFAULT_EXTRACT_TIMEOUT_SECONDS,
        );
        // An artifact must outlive the longest extraction that could still be streaming it.
        let retention_seconds = seconds("VIDEO_API_RETENTION_SECONDS", DEFAULT_RETENTION_SECONDS)
            .max(extract_timeout_seconds);
        let sweep_interval_seconds = seconds(
            "VIDEO_API_SWEEP_INTERVAL_SECONDS",
            DEFAULT_SWEEP_INTERVAL_SECONDS,
        );
        let expired_grace_seconds = seconds(
            "VIDEO_API_EXPIRED_GRACE_SECONDS",
            DEFAULT_EXPIRED_GRACE_SECONDS,
        );

        let ytdlp_bin = lookup("VIDEO_API_YTDLP_BIN")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("yt-dlp"));

        let ca_cert_path = lookup("CA_CERT_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let max_filename_length = lookup("VIDEO_API_MAX_FILENAME_LENGTH")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v >= 8)
            .unwrap_or(DEFAULT_MAX_FILENAME_LENGTH);

        Ok(Self {
            bind_addr,
            download_dir,
            retention_seconds,
            sweep_interval_seconds,
            expired_grace_seconds,
            extract_timeout_seconds,
            ytdlp_bin,
            ca_cert_path,
            max_filename_length,
        })
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn expired_grace(&self) -> Duration {
        Duration::from_secs(self.expired_grace_seconds)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_seconds)
    }
}
