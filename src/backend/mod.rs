//! Typed backend HTTP client (§4.7).
//!
//! Authenticates every request with the `X-Proxy-Key` header (never a query
//! parameter). Downloads stream to disk in 8 KiB chunks so large archives
//! never sit fully in memory.

pub mod error;

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub use error::{BackendError, Result};
use error::classify_status;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1200);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const DOWNLOAD_CHUNK_HINT: usize = 8 * 1024;

/// Progress callback for streamed downloads: `(bytes_done, bytes_total)`.
/// `bytes_total` is 0 when the server did not send `Content-Length`.
pub type ProgressCallback<'a> = Box<dyn FnMut(u64, u64) + Send + 'a>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadMetadata {
    pub name: String,
    pub patient_id: String,
    pub study_description: String,
    pub metadata: Value,
    pub conflict_resolution: String,
}

impl UploadMetadata {
    pub fn new(
        patient_name: Option<&str>,
        patient_id: impl Into<String>,
        study_description: Option<&str>,
        metadata: Value,
    ) -> Self {
        Self {
            name: patient_name.filter(|n| !n.is_empty()).unwrap_or("UNKNOWN").to_string(),
            patient_id: patient_id.into(),
            study_description: study_description.unwrap_or_default().to_string(),
            metadata,
            conflict_resolution: "skip_existing".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    proxy_key: String,
    workspace_id: RwLock<Option<String>>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, proxy_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            proxy_key: proxy_key.into(),
            workspace_id: RwLock::new(None),
        })
    }

    /// Set from the WebSocket control channel's initial `connected`/first
    /// event message (§4.8) before any workspace-scoped REST call is made.
    pub fn set_workspace_id(&self, workspace_id: impl Into<String>) {
        *self.workspace_id.write().unwrap_or_else(|p| p.into_inner()) = Some(workspace_id.into());
    }

    pub fn workspace_id(&self) -> Option<String> {
        self.workspace_id.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn require_workspace_id(&self) -> Result<String> {
        self.workspace_id()
            .ok_or_else(|| BackendError::UnexpectedStatus {
                status: 0,
                body: "workspace_id not yet set by control channel".to_string(),
            })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status_code, body))
    }

    /// `GET /api/v1/proxy/configuration`.
    pub async fn get_configuration(&self) -> Result<Value> {
        let response = self
            .client
            .get(self.url("/api/v1/proxy/configuration"))
            .header("X-Proxy-Key", &self.proxy_key)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidJson(e.to_string()))
    }

    async fn list_entities(&self, kind: &str, filters: &HashMap<String, String>) -> Result<Value> {
        let workspace_id = self.require_workspace_id()?;
        let response = self
            .client
            .get(self.url(&format!("/api/v1/proxy/{workspace_id}/{kind}")))
            .header("X-Proxy-Key", &self.proxy_key)
            .query(filters)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidJson(e.to_string()))
    }

    pub async fn list_subjects(&self, filters: &HashMap<String, String>) -> Result<Value> {
        self.list_entities("subjects", filters).await
    }

    pub async fn list_sessions(&self, filters: &HashMap<String, String>) -> Result<Value> {
        self.list_entities("sessions", filters).await
    }

    pub async fn list_scans(&self, filters: &HashMap<String, String>) -> Result<Value> {
        self.list_entities("scans", filters).await
    }

    async fn get_entity(&self, kind: &str, id: &str) -> Result<Value> {
        let workspace_id = self.require_workspace_id()?;
        let response = self
            .client
            .get(self.url(&format!("/api/v1/proxy/{workspace_id}/{kind}/{id}")))
            .header("X-Proxy-Key", &self.proxy_key)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidJson(e.to_string()))
    }

    pub async fn get_subject(&self, subject_id: &str) -> Result<Value> {
        self.get_entity("subjects", subject_id).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Value> {
        self.get_entity("sessions", session_id).await
    }

    pub async fn get_scan(&self, scan_id: &str) -> Result<Value> {
        self.get_entity("scans", scan_id).await
    }

    /// Stream an entity's archive download to `dest` in 8 KiB chunks,
    /// reporting progress through `on_progress` at most once per chunk.
    async fn download_entity(
        &self,
        kind: &str,
        id: &str,
        filters: &HashMap<String, String>,
        dest: &Path,
        mut on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<()> {
        let workspace_id = self.require_workspace_id()?;
        let response = self
            .client
            .get(self.url(&format!("/api/v1/proxy/{workspace_id}/{kind}/{id}/download")))
            .header("X-Proxy-Key", &self.proxy_key)
            .query(filters)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let total = response.content_length().unwrap_or(0);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(cb) = on_progress.as_mut() {
                cb(downloaded, total);
            }
        }
        file.flush().await?;
        debug!(bytes = downloaded, chunk_hint = DOWNLOAD_CHUNK_HINT, "download complete");
        Ok(())
    }

    pub async fn download_subject(
        &self,
        subject_id: &str,
        dest: &Path,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<()> {
        self.download_entity("subjects", subject_id, &HashMap::new(), dest, on_progress)
            .await
    }

    pub async fn download_session(
        &self,
        session_id: &str,
        dest: &Path,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<()> {
        self.download_entity("sessions", session_id, &HashMap::new(), dest, on_progress)
            .await
    }

    pub async fn download_scan(
        &self,
        scan_id: &str,
        dest: &Path,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<()> {
        self.download_entity("scans", scan_id, &HashMap::new(), dest, on_progress)
            .await
    }

    /// `POST /api/v1/proxy/{workspace}/archives` — custom archive creation.
    pub async fn create_archive(&self, archive_name: &str, entity_selections: Value) -> Result<Value> {
        let workspace_id = self.require_workspace_id()?;
        let body = serde_json::json!({
            "archive_name": archive_name,
            "entity_selections": entity_selections,
            "compression_format": "zip",
            "compression_level": 6,
        });
        let response = self
            .client
            .post(self.url(&format!("/api/v1/proxy/{workspace_id}/archives")))
            .header("X-Proxy-Key", &self.proxy_key)
            .json(&body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidJson(e.to_string()))
    }

    pub async fn get_archive_status(&self, archive_id: &str) -> Result<Value> {
        self.get_entity("archives", archive_id).await
    }

    pub async fn download_archive(&self, archive_id: &str, dest: &Path) -> Result<()> {
        self.download_entity("archives", archive_id, &HashMap::new(), dest, None)
            .await
    }

    /// `POST /api/v1/proxy/{workspace}/archives/upload` — multipart upload
    /// of a completed study ZIP (§4.6 step 6). 300 s timeout, independent of
    /// the client's default.
    pub async fn upload_archive(
        &self,
        zip_path: &Path,
        metadata: &UploadMetadata,
    ) -> Result<UploadResponse> {
        let workspace_id = self.require_workspace_id()?;
        let file_bytes = tokio::fs::read(zip_path).await?;
        let file_name = zip_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive.zip".to_string());

        let file_part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(file_name)
            .mime_str("application/zip")?;

        let metadata_json = serde_json::to_string(&metadata.metadata).unwrap_or_default();
        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("name", metadata.name.clone())
            .text("patient_id", metadata.patient_id.clone())
            .text("study_description", metadata.study_description.clone())
            .text("metadata", metadata_json)
            .text("conflict_resolution", metadata.conflict_resolution.clone());

        let response = self
            .client
            .post(self.url(&format!("/api/v1/proxy/{workspace_id}/archives/upload")))
            .header("X-Proxy-Key", &self.proxy_key)
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidJson(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_follows_section_4_6_rules() {
        assert!(classify_status(500, String::new()).is_retryable());
        assert!(classify_status(408, String::new()).is_retryable());
        assert!(classify_status(429, String::new()).is_retryable());
        assert!(!classify_status(404, String::new()).is_retryable());
        assert!(!classify_status(401, String::new()).is_retryable());
        assert!(!classify_status(400, String::new()).is_retryable());
    }

    #[test]
    fn upload_metadata_defaults_unknown_name_when_patient_name_missing() {
        let metadata = UploadMetadata::new(None, "12345", None, Value::Null);
        assert_eq!(metadata.name, "UNKNOWN");
        assert_eq!(metadata.conflict_resolution, "skip_existing");
    }

    #[test]
    fn workspace_id_round_trips() {
        let client = BackendClient::new("https://example.test", "secret-key").unwrap();
        assert!(client.workspace_id().is_none());
        client.set_workspace_id("ws-1");
        assert_eq!(client.workspace_id().as_deref(), Some("ws-1"));
    }
}
