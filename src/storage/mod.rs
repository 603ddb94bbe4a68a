use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod database_manager;
pub mod filesystem;
pub mod instance_index;
pub mod repository;
pub mod staging;

pub use database_manager::{DatabaseBackend, DatabaseManager, DatabaseOperation, DatabaseStats};
pub use filesystem::FilesystemStorage;
pub use instance_index::InstanceIndex;
pub use repository::{MappingRepo, ProxyStore, ScanRepo, SessionRepo, UploadLogRepo};
pub use staging::{StageResult, StagingStore, StoreRequest};

/// Maximum length of a sanitized path component (I5).
const MAX_SANITIZED_LEN: usize = 255;

/// Sanitize a DICOM UID (or any other value) for safe use as a filesystem
/// path component (I5): dots, slashes and backslashes are replaced, any
/// resulting `..` sequence is neutralized, and the result is capped at
/// `MAX_SANITIZED_LEN` characters.
pub fn sanitize_uid(value: &str) -> String {
    let mut sanitized: String = value
        .chars()
        .map(|c| match c {
            '.' | '/' | '\\' => '_',
            other => other,
        })
        .collect();

    while sanitized.contains("..") {
        sanitized = sanitized.replace("..", "_");
    }

    if sanitized.len() > MAX_SANITIZED_LEN {
        sanitized.truncate(MAX_SANITIZED_LEN);
    }

    if sanitized.is_empty() {
        sanitized.push('_');
    }

    sanitized
}

/// Build `<storageRoot>/<sanitized patientId>/<sanitized studyUid>/<sanitized
/// seriesUid>` for a series directory, per the staging store layout (§4.4).
pub fn series_dir(storage_root: &Path, patient_id: &str, study_uid: &str, series_uid: &str) -> PathBuf {
    storage_root
        .join(sanitize_uid(patient_id))
        .join(sanitize_uid(study_uid))
        .join(sanitize_uid(series_uid))
}

/// Build the on-disk path for one stored instance within its series directory.
pub fn instance_path(series_dir: &Path, sop_instance_uid: &str) -> PathBuf {
    series_dir.join(format!("{}.dcm", sanitize_uid(sop_instance_uid)))
}

/// Error type for storage operations
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Path(String),
    Config(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Path(e) => write!(f, "Path error: {}", e),
            StorageError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage backend trait for abstracting temporary file operations
///
/// This trait provides a consistent interface for storage operations that can be
/// implemented by different backends (filesystem, cloud storage, etc.)
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Get the base path for this storage backend
    fn base_path(&self) -> &Path;

    /// Whether this backend represents a writable local filesystem root
    /// Defaults to false; concrete backends can override to opt-in.
    fn is_filesystem(&self) -> bool {
        false
    }

    /// Create a subpath relative to the storage root
    fn subpath_str(&self, path: &str) -> PathBuf {
        self.base_path().join(path)
    }

    /// Create a subpath relative to the storage root  
    fn subpath_path(&self, path: &Path) -> PathBuf {
        self.base_path().join(path)
    }

    /// Ensure a directory exists under the storage root, creating it if necessary
    fn ensure_dir_str(&self, path: &str) -> StorageResult<PathBuf> {
        let full_path = self.subpath_str(path);
        std::fs::create_dir_all(&full_path)?;
        Ok(full_path)
    }

    /// Create a temporary directory with a given prefix within a subdirectory
    fn tempdir_in_str(&self, subdir: &str, prefix: &str) -> StorageResult<tempfile::TempDir> {
        let parent = self.ensure_dir_str(subdir)?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&parent)
            .map_err(StorageError::from)
    }

    /// Write bytes to a file at the given relative path
    async fn write_file_str(&self, path: &str, contents: &[u8]) -> StorageResult<PathBuf> {
        let full_path = self.subpath_str(path);

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tokio::fs::write(&full_path, contents).await?;
        Ok(full_path)
    }

    /// Read bytes from a file at the given relative path
    async fn read_file_str(&self, path: &str) -> StorageResult<Vec<u8>> {
        let full_path = self.subpath_str(path);
        tokio::fs::read(&full_path)
            .await
            .map_err(StorageError::from)
    }

    /// Check if a file exists at the given relative path
    fn exists_str(&self, path: &str) -> bool {
        self.subpath_str(path).exists()
    }

    /// Remove a file or directory at the given relative path
    async fn remove_str(&self, path: &str) -> StorageResult<()> {
        let full_path = self.subpath_str(path);
        if full_path.is_dir() {
            tokio::fs::remove_dir_all(&full_path).await?;
        } else {
            tokio::fs::remove_file(&full_path).await?
        }
        Ok(())
    }
}

/// Configuration for storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub options: std::collections::HashMap<String, serde_json::Value>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let mut options = std::collections::HashMap::new();
        options.insert(
            "path".to_string(),
            serde_json::Value::String("./tmp".to_string()),
        );

        Self {
            backend: default_backend(),
            options,
        }
    }
}

fn default_backend() -> String {
    "filesystem".to_string()
}

/// Create a storage backend from configuration
pub fn create_storage_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config.backend.as_str() {
        "filesystem" => {
            let path = config
                .options
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or("./tmp");

            let storage = FilesystemStorage::new(path)?;
            Ok(Arc::new(storage))
        }
        _ => Err(StorageError::Config(format!(
            "Unknown storage backend: {}",
            config.backend
        ))),
    }
}

#[cfg(test)]
mod path_tests {
    use super::*;

    #[test]
    fn sanitize_uid_replaces_dots_and_separators() {
        assert_eq!(sanitize_uid("1.2.840.10008"), "1_2_840_10008");
        assert_eq!(sanitize_uid("a/b\\c"), "a_b_c");
    }

    #[test]
    fn sanitize_uid_neutralizes_traversal_sequences() {
        let sanitized = sanitize_uid("../../etc/passwd");
        assert!(!sanitized.contains(".."));
    }

    #[test]
    fn sanitize_uid_caps_length() {
        let long = "1".repeat(500);
        assert_eq!(sanitize_uid(&long).len(), MAX_SANITIZED_LEN);
    }

    #[test]
    fn series_dir_nests_under_sanitized_components() {
        let root = Path::new("/data/pacs");
        let dir = series_dir(root, "PAT.1", "1.2.3", "1.2.3.1");
        assert_eq!(dir, root.join("PAT_1").join("1_2_3").join("1_2_3_1"));
    }
}
