use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use tracing::{info, warn};

use super::bundle::extract_zip;
use crate::error::ArchiveError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Client of the archive server that stores uploaded result archives and
/// serves screenshot baselines.
#[derive(Debug, Clone)]
pub struct ArchiveServer {
    client: Client,
    base: String,
    storage_key: Option<String>,
}

impl ArchiveServer {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(base: &str, storage_key: Option<String>) -> Result<Self, ArchiveError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .map_err(|source| ArchiveError::Server {
                context: "building client",
                source,
            })?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_owned(),
            storage_key,
        })
    }

    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Uploads a zipped archive and logs the server's reply line by line.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or the server rejects
    /// the upload.
    pub async fn upload(&self, zip_path: &Path, archive_path: &str) -> Result<String, ArchiveError> {
        let context = "upload";
        let bytes = tokio::fs::read(zip_path)
            .await
            .map_err(|source| ArchiveError::Io {
                context: "reading archive",
                path: zip_path.to_path_buf(),
                source,
            })?;
        let file_name = zip_path
            .file_name()
            .map_or_else(|| "archive.zip".to_owned(), |name| name.to_string_lossy().into_owned());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/zip")
            .map_err(|source| ArchiveError::Server { context, source })?;
        let form = Form::new()
            .part("file", part)
            .text("storageKey", self.storage_key.clone().unwrap_or_default())
            .text("archivePath", archive_path.to_owned());

        let response = self
            .client
            .post(format!("{}/upload", self.base))
            .multipart(form)
            .send()
            .await
            .map_err(|source| ArchiveError::Server { context, source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::ServerStatus {
                context,
                status: status.as_u16(),
            });
        }
        let reply = response
            .text()
            .await
            .map_err(|source| ArchiveError::Server { context, source })?;
        let has_warning = reply.to_lowercase().contains("warning");
        for line in reply.lines() {
            if has_warning {
                warn!("Archive server: {}", line);
            } else {
                info!("Archive server: {}", line);
            }
        }
        Ok(reply)
    }

    /// Downloads the baseline for `archive_path` and extracts it into
    /// `target`. Returns `false` when the server has no baseline.
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails or the archive cannot be
    /// extracted.
    pub async fn download_baseline(
        &self,
        archive_path: &str,
        target: &Path,
    ) -> Result<bool, ArchiveError> {
        let context = "baseline download";
        let remote_path = format!("{}/baseline", archive_path.trim_end_matches('/'));
        let response = self
            .client
            .get(format!("{}/download", self.base))
            .query(&[
                ("storageKey", self.storage_key.clone().unwrap_or_default()),
                ("path", remote_path),
            ])
            .send()
            .await
            .map_err(|source| ArchiveError::Server { context, source })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            info!("No baseline stored for '{}'", archive_path);
            return Ok(false);
        }
        if !status.is_success() {
            return Err(ArchiveError::ServerStatus {
                context,
                status: status.as_u16(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|source| ArchiveError::Server { context, source })?;

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|source| ArchiveError::Io {
                context: "creating baseline directory",
                path: target.to_path_buf(),
                source,
            })?;
        let zip_path = baseline_zip_path(target);
        tokio::fs::write(&zip_path, &bytes)
            .await
            .map_err(|source| ArchiveError::Io {
                context: "writing baseline archive",
                path: zip_path.clone(),
                source,
            })?;
        let dir = target.to_path_buf();
        let archive = zip_path.clone();
        tokio::task::spawn_blocking(move || extract_zip(&archive, &dir)).await??;
        tokio::fs::remove_file(&zip_path)
            .await
            .map_err(|source| ArchiveError::Io {
                context: "removing baseline archive",
                path: zip_path,
                source,
            })?;
        Ok(true)
    }
}

fn baseline_zip_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map_or_else(|| "baseline".into(), std::ffi::OsStr::to_os_string);
    name.push(".zip");
    target.with_file_name(name)
}
