use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::models::MediaFormat;

/// Creates the download root and returns its absolute, symlink-free form.
pub async fn ensure_download_root(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create download directory at {}", path.display()))?;
    fs::canonicalize(path)
        .await
        .with_context(|| format!("Failed to resolve download directory {}", path.display()))
}

/// yt-dlp output template; the tool fills in the extension.
pub fn job_output_template(download_root: &Path, job_id: &str) -> PathBuf {
    download_root.join(format!("{job_id}.%(ext)s"))
}

pub fn is_job_file(path: &Path, job_id: &str) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(job_id))
        .is_some_and(|rest| rest.starts_with('.'))
}

pub async fn find_job_files(download_root: &Path, job_id: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = fs::read_dir(download_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_job_file(&path, job_id) && entry.file_type().await?.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Removes everything the tool left behind for `job_id`, including `.part` files.
pub async fn remove_job_files(download_root: &Path, job_id: &str) -> Result<usize> {
    let files = find_job_files(download_root, job_id)
        .await
        .with_context(|| format!("Failed to scan {}", download_root.display()))?;
    let mut removed = 0;
    for path in files {
        delete_file_if_exists(&path).await?;
        removed += 1;
    }
    Ok(removed)
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

/// Keeps word characters, whitespace and `-`, collapses whitespace runs to `_`
/// and truncates to `max_length` characters.
pub fn sanitize_filename(raw: &str, max_length: usize) -> String {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();

    let mut out = String::with_capacity(kept.len());
    let mut in_space = false;
    for c in kept.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }

    out.chars().take(max_length).collect()
}

/// Name presented to the client: sanitized media title plus the artifact extension.
pub fn download_file_name(
    title: Option<&str>,
    artifact_path: &Path,
    format: MediaFormat,
    max_length: usize,
) -> String {
    let ext = artifact_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    let stem_budget = max_length.saturating_sub(ext.chars().count()).max(1);

    let stem = title
        .map(|title| sanitize_filename(title, stem_budget))
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| format.as_str().to_string());

    format!("{stem}{ext}")
}

/// RFC 5987 `Content-Disposition` value and the percent-encoded name it carries.
pub fn content_disposition(file_name: &str) -> (String, String) {
    let encoded = urlencoding::encode(file_name).into_owned();
    (format!("attachment; filename*=UTF-8''{encoded}"), encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_unsafe_characters() {
        assert_eq!(
            sanitize_filename("My Cat: the *movie*!  (2024)", 100),
            "My_Cat_the_movie_2024"
        );
        assert_eq!(sanitize_filename("../../etc/passwd", 100), "etcpasswd");
        assert_eq!(sanitize_filename("日本語 タイトル", 100), "日本語_タイトル");
        assert_eq!(sanitize_filename("abcdefghij", 4), "abcd");
    }

    #[test]
    fn download_name_keeps_extension_within_budget() {
        let path = Path::new("/tmp/x/1234.mp4");
        assert_eq!(
            download_file_name(Some("Funny clip"), path, MediaFormat::Video, 100),
            "Funny_clip.mp4"
        );
        assert_eq!(
            download_file_name(Some("abcdefghijkl"), path, MediaFormat::Video, 10),
            "abcdef.mp4"
        );
        assert_eq!(
            download_file_name(Some("???"), Path::new("/tmp/x/1.m4a"), MediaFormat::Audio, 100),
            "audio.m4a"
        );
        assert_eq!(
            download_file_name(None, path, MediaFormat::Video, 100),
            "video.mp4"
        );
    }

    #[test]
    fn content_disposition_is_percent_encoded() {
        let (header, encoded) = content_disposition("猫_clip.mp4");
        assert_eq!(encoded, "%E7%8C%AB_clip.mp4");
        assert_eq!(header, "attachment; filename*=UTF-8''%E7%8C%AB_clip.mp4");
    }

    #[test]
    fn job_file_matching_requires_dot_after_id() {
        assert!(is_job_file(Path::new("/d/abc.mp4"), "abc"));
        assert!(is_job_file(Path::new("/d/abc.mp4.part"), "abc"));
        assert!(!is_job_file(Path::new("/d/abcd.mp4"), "abc"));
        assert!(!is_job_file(Path::new("/d/xabc.mp4"), "abc"));
    }

    #[tokio::test]
    async fn remove_job_files_only_touches_that_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["job1.mp4.part", "job1.ytdl", "job2.mp4"] {
            fs::write(dir.path().join(name), b"x").await.expect("write");
        }

        let removed = remove_job_files(dir.path(), "job1").await.expect("remove");
        assert_eq!(removed, 2);
        assert!(find_job_files(dir.path(), "job1").await.expect("scan").is_empty());
        assert!(dir.path().join("job2.mp4").exists());
    }

    #[tokio::test]
    async fn download_root_is_resolved_to_an_absolute_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("a").join("..").join("downloads");

        let root = ensure_download_root(&nested).await.expect("root");
        assert!(root.is_absolute());
        assert!(root.is_dir());
        assert_eq!(
            root,
            tmp.path().canonicalize().expect("canon").join("downloads")
        );
    }

    #[tokio::test]
    async fn delete_tolerates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        delete_file_if_exists(&dir.path().join("gone.mp4"))
            .await
            .expect("missing file is fine");
    }
}
