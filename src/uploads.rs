//! Storage for uploaded images.
//!
//! Files are written under the configured temp directory with a random name
//! so user-supplied filenames never reach the filesystem.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::error::UploadError;

/// A file that has been persisted for a workflow
#[derive(Debug, Clone, Serialize)]
pub struct StoredUpload {
    pub original_name: String,
    pub path: PathBuf,
    pub size: usize,
}

/// Validates and persists uploads
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    allowed_extensions: Vec<String>,
    max_file_size_mb: u64,
    max_file_size_bytes: usize,
    max_files_per_request: usize,
}

impl UploadStore {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            dir: config.temp_dir.clone(),
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|ext| ext.to_lowercase())
                .collect(),
            max_file_size_mb: config.max_file_size_mb,
            max_file_size_bytes: config.max_file_size_bytes(),
            max_files_per_request: config.max_files_per_request,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_files_per_request(&self) -> usize {
        self.max_files_per_request
    }

    /// Create the upload directory if needed
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Lowercased extension including the dot, if it is on the allow-list
    fn checked_extension(&self, filename: &str) -> Result<String, UploadError> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()))
            .unwrap_or_default();

        if self.allowed_extensions.contains(&ext) {
            Ok(ext)
        } else {
            Err(UploadError::DisallowedExtension(if ext.is_empty() {
                "(none)".to_string()
            } else {
                ext
            }))
        }
    }

    /// Validate and write one upload
    pub async fn save(&self, filename: &str, bytes: &[u8]) -> Result<StoredUpload, UploadError> {
        if filename.trim().is_empty() {
            return Err(UploadError::MissingFilename);
        }
        let ext = self.checked_extension(filename)?;

        if bytes.len() > self.max_file_size_bytes {
            return Err(UploadError::TooLarge {
                name: filename.to_string(),
                limit_mb: self.max_file_size_mb,
            });
        }

        let path = self.dir.join(format!("{}{}", Uuid::new_v4(), ext));
        self.ensure_dirs().await?;
        tokio::fs::write(&path, bytes).await?;
        debug!("Stored upload {} ({} bytes) at {:?}", filename, bytes.len(), path);

        Ok(StoredUpload {
            original_name: filename.to_string(),
            path,
            size: bytes.len(),
        })
    }
}
