//! Completion pipeline (§4.6): registered as a study-completion callback on
//! the [`crate::monitor::StudyMonitor`]. Archives the finished study, uploads
//! it to the backend with retry/backoff, and records the outcome in an
//! `UploadLog` row.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sysinfo::Disks;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::backend::{BackendClient, UploadMetadata};
use crate::models::UploadLog;
use crate::monitor::CompletionCallback;
use crate::storage::{sanitize_uid, ProxyStore};

const MIN_FREE_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum PipelineError {
    SessionNotFound(String),
    Archive(String),
    Upload(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::SessionNotFound(uid) => write!(f, "no session for study {uid}"),
            PipelineError::Archive(msg) => write!(f, "archive error: {msg}"),
            PipelineError::Upload(msg) => write!(f, "upload error: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub archive_root: PathBuf,
    pub auto_dispatch_enabled: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub cleanup_after_upload: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            archive_root: PathBuf::from("./archives"),
            auto_dispatch_enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            cleanup_after_upload: false,
        }
    }
}

/// Checks that the filesystem backing `path` has at least `min_bytes` free,
/// matching the longest mount point prefix of `path`.
fn has_min_free_space(path: &Path, min_bytes: u64) -> bool {
    let disks = Disks::new_with_refreshed_list();
    let mut best_match: Option<(&Path, u64)> = None;
    for disk in disks.list() {
        let mount_point = disk.mount_point();
        if path.starts_with(mount_point) {
            let is_better = best_match
                .map(|(current, _)| mount_point.as_os_str().len() > current.as_os_str().len())
                .unwrap_or(true);
            if is_better {
                best_match = Some((mount_point, disk.available_space()));
            }
        }
    }
    match best_match {
        Some((_, available)) => available >= min_bytes,
        // No disk entry matched (e.g. tmpfs in a container); don't block
        // archiving on an inconclusive check.
        None => true,
    }
}

/// Build `<archiveRoot>/<patientID>_<studyUID>.zip` containing every file
/// under `storage_path`, entry names relative to `storage_path`'s parent.
fn build_archive(archive_root: &Path, patient_id: &str, study_uid: &str, storage_path: &Path) -> Result<PathBuf, PipelineError> {
    if !has_min_free_space(archive_root, MIN_FREE_BYTES) {
        return Err(PipelineError::Archive(format!(
            "archive root {} has less than 1 GiB free",
            archive_root.display()
        )));
    }

    std::fs::create_dir_all(archive_root).map_err(|e| PipelineError::Archive(e.to_string()))?;
    let archive_name = sanitize_uid(&format!("{patient_id}_{study_uid}"));
    let archive_path = archive_root.join(format!("{archive_name}.zip"));

    let file = std::fs::File::create(&archive_path).map_err(|e| PipelineError::Archive(e.to_string()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let base = storage_path.parent().unwrap_or(storage_path);
    for entry in WalkDir::new(storage_path).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(base)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        writer
            .start_file(relative, options)
            .map_err(|e| PipelineError::Archive(e.to_string()))?;
        let contents = std::fs::read(entry.path()).map_err(|e| PipelineError::Archive(e.to_string()))?;
        writer.write_all(&contents).map_err(|e| PipelineError::Archive(e.to_string()))?;
    }
    writer.finish().map_err(|e| PipelineError::Archive(e.to_string()))?;

    Ok(archive_path)
}

/// Completion pipeline: archive → upload (with retry) → UploadLog.
pub struct CompletionPipeline {
    config: PipelineConfig,
    store: ProxyStore,
    backend: Arc<BackendClient>,
    completed_studies: Mutex<HashSet<String>>,
}

impl CompletionPipeline {
    pub fn new(config: PipelineConfig, store: ProxyStore, backend: Arc<BackendClient>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            backend,
            completed_studies: Mutex::new(HashSet::new()),
        })
    }

    async fn process(&self, study_instance_uid: &str) -> Result<(), PipelineError> {
        let sessions = self.store.sessions();
        let mut session = match sessions
            .find_by_study_uid(study_instance_uid)
            .map_err(|e| PipelineError::SessionNotFound(e.to_string()))?
        {
            Some(session) => session,
            None => {
                warn!(study_instance_uid, "study monitor fired for unknown session");
                return Ok(());
            }
        };

        session.finalize();
        sessions
            .upsert(&session)
            .map_err(|e| PipelineError::Archive(e.to_string()))?;

        if !self.config.auto_dispatch_enabled {
            info!(study_instance_uid, "auto-dispatch disabled, pipeline stops after finalize");
            return Ok(());
        }

        let archive_path = build_archive(
            &self.config.archive_root,
            &session.patient_id,
            study_instance_uid,
            Path::new(&session.storage_path),
        )?;

        let scans = self.store.scans().find_by_study_uid(study_instance_uid).unwrap_or_default();
        let instances_count: u32 = scans.iter().map(|s| s.instances_count).sum();
        let metadata = UploadMetadata::new(
            Some(&session.patient_name),
            session.patient_id.clone(),
            session.study_description.as_deref(),
            json!({
                "study_uid": study_instance_uid,
                "study_date": session.study_date,
                "series_count": scans.len(),
                "instances_count": instances_count,
            }),
        );

        self.upload_with_retry(study_instance_uid, &archive_path, &metadata).await
    }

    async fn upload_with_retry(
        &self,
        study_instance_uid: &str,
        archive_path: &Path,
        metadata: &UploadMetadata,
    ) -> Result<(), PipelineError> {
        let upload_logs = self.store.upload_logs();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut log = UploadLog::start_attempt(study_instance_uid, attempt);

            match self.backend.upload_archive(archive_path, metadata).await {
                Ok(response) => {
                    let file_size = std::fs::metadata(archive_path).map(|m| m.len()).unwrap_or(0);
                    log.mark_success(response.id.clone(), file_size);
                    upload_logs
                        .append(&log)
                        .map_err(|e| PipelineError::Upload(e.to_string()))?;

                    self.mark_uploaded(study_instance_uid)?;
                    self.cleanup(archive_path, study_instance_uid);
                    info!(study_instance_uid, api_response_id = %response.id, "study uploaded");
                    return Ok(());
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    log.mark_failed(e.to_string(), classify_error_code(&e));
                    upload_logs
                        .append(&log)
                        .map_err(|e| PipelineError::Upload(e.to_string()))?;

                    if !retryable || attempt >= self.config.max_retries {
                        error!(study_instance_uid, attempt, error = %e, "upload failed, giving up");
                        return Err(PipelineError::Upload(e.to_string()));
                    }

                    warn!(study_instance_uid, attempt, error = %e, "upload attempt failed, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    fn mark_uploaded(&self, study_instance_uid: &str) -> Result<(), PipelineError> {
        let sessions = self.store.sessions();
        if let Some(mut session) = sessions
            .find_by_study_uid(study_instance_uid)
            .map_err(|e| PipelineError::Upload(e.to_string()))?
        {
            session.status = crate::models::SessionStatus::Uploaded;
            sessions
                .upsert(&session)
                .map_err(|e| PipelineError::Upload(e.to_string()))?;
        }
        Ok(())
    }

    fn cleanup(&self, archive_path: &Path, study_instance_uid: &str) {
        if let Err(e) = std::fs::remove_file(archive_path) {
            warn!(study_instance_uid, error = %e, "failed to remove archive after upload");
        }
        if self.config.cleanup_after_upload {
            if let Ok(Some(session)) = self.store.sessions().find_by_study_uid(study_instance_uid) {
                if let Err(e) = std::fs::remove_dir_all(&session.storage_path) {
                    warn!(study_instance_uid, error = %e, "failed to remove storage path after upload");
                }
            }
        }
    }
}

fn classify_error_code(error: &crate::backend::BackendError) -> String {
    match error {
        crate::backend::BackendError::InvalidProxyKey => "EAUTH".to_string(),
        crate::backend::BackendError::ProxyInactive => "EINACTIVE".to_string(),
        crate::backend::BackendError::NotFound(_) => "ENOTFOUND".to_string(),
        crate::backend::BackendError::UnexpectedStatus { status, .. } => format!("EHTTP{status}"),
        crate::backend::BackendError::Request(_) => "ENETWORK".to_string(),
        crate::backend::BackendError::Io(_) => "EIO".to_string(),
        crate::backend::BackendError::InvalidJson(_) => "EBADJSON".to_string(),
    }
}

#[async_trait]
impl CompletionCallback for CompletionPipeline {
    async fn on_study_complete(&self, study_instance_uid: &str) {
        {
            let mut completed = self
                .completed_studies
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !completed.insert(study_instance_uid.to_string()) {
                return;
            }
        }

        if let Err(e) = self.process(study_instance_uid).await {
            error!(study_instance_uid, error = %e, "completion pipeline failed");
        }

        self.completed_studies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(study_instance_uid);
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn build_archive_zips_every_file_under_storage_path() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage_path = temp_dir.path().join("1.2.3").join("1.2.3.1");
        std::fs::create_dir_all(&storage_path).unwrap();
        std::fs::write(storage_path.join("1.dcm"), b"fake").unwrap();

        let archive_root = temp_dir.path().join("archives");
        let study_dir = temp_dir.path().join("1.2.3");
        let archive_path = build_archive(&archive_root, "ANON-1", "1.2.3", &study_dir).unwrap();

        assert!(archive_path.exists());
        let file = std::fs::File::open(&archive_path).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn archive_name_is_sanitized() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage_path = temp_dir.path().join("study");
        std::fs::create_dir_all(&storage_path).unwrap();
        std::fs::write(storage_path.join("a.dcm"), b"x").unwrap();

        let archive_root = temp_dir.path().join("archives");
        let archive_path = build_archive(&archive_root, "PAT/1", "1.2.3", &storage_path).unwrap();

        let file_name = archive_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.contains("PAT_1"));
        assert!(!file_name.contains('/'));
    }
}
