//! File downloads and line-ending normalization
//!
//! Files listed in the settings are fetched into the sequence's work directory
//! before the command runs. Scripts authored on Windows frequently carry CRLF
//! line endings that `/bin/sh` rejects, so downloaded files and inline scripts
//! are normalized to LF unless the configuration opts out.

use crate::errors::ExecutionError;
use crate::io::write_atomic;
use crate::settings::StorageCredentials;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Per-request timeout for downloads
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Fetches the files a configuration depends on
pub trait Downloader {
    /// Download every URL into `dest_dir`, returning the local paths in order.
    fn download(
        &self,
        urls: &[String],
        dest_dir: &Path,
        credentials: Option<&StorageCredentials>,
    ) -> Result<Vec<PathBuf>, ExecutionError>;
}

/// Plain HTTP(S) downloader
#[derive(Debug, Default, Clone)]
pub struct HttpDownloader;

impl Downloader for HttpDownloader {
    #[instrument(skip_all, fields(count = urls.len(), dest = %dest_dir.display()))]
    fn download(
        &self,
        urls: &[String],
        dest_dir: &Path,
        credentials: Option<&StorageCredentials>,
    ) -> Result<Vec<PathBuf>, ExecutionError> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(credentials) = credentials {
            return Err(ExecutionError::Download {
                url: urls[0].clone(),
                message: format!(
                    "authenticated downloads from storage account '{}' are not supported",
                    credentials.account_name
                ),
            });
        }

        fs::create_dir_all(dest_dir)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| ExecutionError::Download {
                url: urls[0].clone(),
                message: e.to_string(),
            })?;

        let mut paths = Vec::with_capacity(urls.len());
        for url in urls {
            let download_error = |message: String| ExecutionError::Download {
                url: url.clone(),
                message,
            };
            let target = dest_dir.join(file_name_from_url(url).map_err(download_error)?);

            let response = client
                .get(url)
                .send()
                .and_then(|r| r.error_for_status())
                .map_err(|e| download_error(e.to_string()))?;
            let bytes = response.bytes().map_err(|e| download_error(e.to_string()))?;

            fs::write(&target, &bytes)?;
            debug!(url = %url, path = %target.display(), size = bytes.len(), "Downloaded file");
            paths.push(target);
        }

        info!("Downloaded {} file(s)", paths.len());
        Ok(paths)
    }
}

/// Derive a local filename from the last path segment of `url`, ignoring any
/// query string (SAS tokens live there).
pub fn file_name_from_url(url: &str) -> Result<String, String> {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or_default(),
        None => without_query,
    };
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || name.contains(':') || name == "." || name == ".." {
        return Err(format!("cannot derive a file name from {:?}", url));
    }
    Ok(name.to_string())
}

/// Rewrite CRLF line endings in `path` to LF. Returns whether the file changed.
#[instrument]
pub fn normalize_line_endings(path: &Path) -> std::io::Result<bool> {
    let content = fs::read(path)?;
    if !content.windows(2).any(|w| w == b"\r\n") {
        return Ok(false);
    }
    let mut normalized = Vec::with_capacity(content.len());
    let mut iter = content.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        normalized.push(byte);
    }
    write_atomic(path, &normalized)?;
    debug!(path = %path.display(), "Normalized line endings");
    Ok(true)
}
