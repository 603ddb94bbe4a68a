//! Control-channel event handlers (spec.md §4.9): dispatch, deletion and
//! config-refresh events delivered over the WebSocket control channel
//! (§4.8). Dispatch and config-refresh are async (they call the backend and
//! the SCU dispatcher); deletions are purely local and synchronous.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use dicom_dictionary_std::tags;
use phi::PhiResolver;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::backend::{BackendClient, ProgressCallback};
use crate::dispatch::ScuDispatcher;
use crate::locks::{DispatchLockManager, EntityType};
use crate::models::NodeConfig;
use crate::nodes::NodeRegistry;
use crate::storage::ProxyStore;

const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),
    #[error("phi error: {0}")]
    Phi(#[from] phi::error::PhiError),
    #[error("dicom object error: {0}")]
    DicomObject(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("missing field: {0}")]
    MissingField(String),
}

/// One inbound control-channel event (§6). `from_value` unwraps the
/// `data.payload`-nested envelope some servers use (§4.8) before parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub event_type: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl InboundEvent {
    pub fn from_value(raw: Value) -> Option<Self> {
        if raw.get("event_type").is_some() {
            return serde_json::from_value(raw).ok();
        }
        raw.get("data")
            .and_then(|d| d.get("payload"))
            .cloned()
            .and_then(|inner| serde_json::from_value(inner).ok())
    }

    fn requested_nodes(&self) -> Vec<String> {
        self.payload
            .get("nodes")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    fn series_number(&self) -> Option<String> {
        self.payload.get("series_number").and_then(Value::as_str).map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityKind {
    Subject,
    Session,
    Scan,
}

impl EntityKind {
    fn lock_entity_type(self) -> EntityType {
        match self {
            EntityKind::Subject => EntityType::Subject,
            EntityKind::Session => EntityType::Session,
            EntityKind::Scan => EntityType::Scan,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            EntityKind::Subject => "subject",
            EntityKind::Session => "session",
            EntityKind::Scan => "scan",
        }
    }
}

fn dispatch_status_message(
    correlation_id: Option<&str>,
    entity_type: &str,
    entity_id: &str,
    node_id: &str,
    status: &str,
    progress: f64,
    files_sent: u32,
    files_total: u32,
) -> Value {
    json!({
        "event_type": "dispatch.status",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "correlation_id": correlation_id,
        "entity_type": entity_type,
        "entity_id": entity_id,
        "payload": {
            "node_id": node_id,
            "status": status,
            "progress": progress,
            "files_sent": files_sent,
            "files_total": files_total,
        }
    })
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), EventError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let out_path = dest.join(entry.mangled_name());
        if entry.name().ends_with('/') {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
    }
    Ok(())
}

/// Owns every collaborator a dispatched/deletion/config event needs, and
/// routes inbound events to the handler for their `event_type`.
pub struct EventHandlers {
    nodes: Arc<NodeRegistry>,
    locks: Arc<DispatchLockManager>,
    backend: Arc<BackendClient>,
    store: ProxyStore,
    dispatcher: Arc<ScuDispatcher>,
    resolver: Arc<PhiResolver>,
    outbox: UnboundedSender<Value>,
    work_dir: PathBuf,
}

impl EventHandlers {
    /// The backend client, for the control channel's identity handshake
    /// (§4.8 sets the workspace id before any workspace-scoped call runs).
    pub fn backend(&self) -> &Arc<BackendClient> {
        &self.backend
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nodes: Arc<NodeRegistry>,
        locks: Arc<DispatchLockManager>,
        backend: Arc<BackendClient>,
        store: ProxyStore,
        dispatcher: Arc<ScuDispatcher>,
        resolver: Arc<PhiResolver>,
        outbox: UnboundedSender<Value>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            nodes,
            locks,
            backend,
            store,
            dispatcher,
            resolver,
            outbox,
            work_dir,
        }
    }

    /// Route one event to its handler, logging (never propagating) failure:
    /// the control channel's receive loop must keep running regardless.
    pub async fn handle(&self, event: InboundEvent) {
        let event_type = event.event_type.clone();
        let result = match event_type.as_str() {
            "subject.dispatch" => self.handle_dispatch(&event, EntityKind::Subject, false).await,
            "session.dispatch" => self.handle_dispatch(&event, EntityKind::Session, false).await,
            "scan.dispatch" => self.handle_dispatch(&event, EntityKind::Scan, false).await,
            "scan.new_scan_available" => self.handle_dispatch(&event, EntityKind::Scan, true).await,
            "session.deleted" => self.handle_session_deleted(&event),
            "scan.deleted" => self.handle_scan_deleted(&event),
            "subject.deleted" => self.handle_subject_deleted(&event),
            "proxy.config_changed" | "proxy.nodes_changed" | "proxy.status_changed" => {
                self.handle_config_refresh().await
            }
            other => {
                warn!(event_type = other, "ignoring unrecognised control-channel event");
                Ok(())
            }
        };
        if let Err(e) = result {
            error!(event_type = %event_type, error = %e, "event handler failed");
        }
    }

    async fn handle_dispatch(
        &self,
        event: &InboundEvent,
        kind: EntityKind,
        all_reachable_readable: bool,
    ) -> Result<(), EventError> {
        let entity_id = event
            .entity_id
            .clone()
            .ok_or_else(|| EventError::MissingField("entity_id".to_string()))?;

        let targets = if all_reachable_readable {
            self.nodes.all_active_reachable_readable()
        } else {
            self.nodes.active_reachable_writable(&event.requested_nodes())
        };

        if targets.is_empty() {
            info!(entity_id = %entity_id, event_type = %event.event_type, "no eligible target nodes, acknowledging");
            return Ok(());
        }

        for node in targets {
            let Some(guard) = self.locks.try_acquire(&node.node_id, kind.lock_entity_type(), &entity_id) else {
                info!(node_id = %node.node_id, entity_id = %entity_id, "dispatch already in progress, skipping");
                continue;
            };
            if let Err(e) = self.dispatch_to_one_node(event, kind, &entity_id, &node).await {
                error!(node_id = %node.node_id, entity_id = %entity_id, error = %e, "dispatch to node failed");
            }
            drop(guard);
        }
        Ok(())
    }

    async fn dispatch_to_one_node(
        &self,
        event: &InboundEvent,
        kind: EntityKind,
        entity_id: &str,
        node: &NodeConfig,
    ) -> Result<(), EventError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("dispatch-")
            .tempdir_in(&self.work_dir)?;
        let archive_path = temp_dir.path().join("archive.zip");

        let correlation_id = event
            .correlation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let correlation_id = Some(correlation_id);
        let last_emit = Arc::new(Mutex::new(Instant::now() - PROGRESS_EMIT_INTERVAL));
        let progress_cb: ProgressCallback<'_> = {
            let outbox = self.outbox.clone();
            let correlation_id = correlation_id.clone();
            let node_id = node.node_id.clone();
            let entity_type = kind.as_str();
            let entity_id = entity_id.to_string();
            Box::new(move |done: u64, total: u64| {
                let mut last = last_emit.lock().unwrap_or_else(|p| p.into_inner());
                if last.elapsed() < PROGRESS_EMIT_INTERVAL {
                    return;
                }
                *last = Instant::now();
                let progress = if total > 0 { done as f64 / total as f64 } else { 0.0 };
                let _ = outbox.send(dispatch_status_message(
                    correlation_id.as_deref(),
                    entity_type,
                    &entity_id,
                    &node_id,
                    "downloading",
                    progress,
                    0,
                    0,
                ));
            })
        };

        match kind {
            EntityKind::Subject => {
                self.backend.download_subject(entity_id, &archive_path, Some(progress_cb)).await?
            }
            EntityKind::Session => {
                self.backend.download_session(entity_id, &archive_path, Some(progress_cb)).await?
            }
            EntityKind::Scan => {
                self.backend.download_scan(entity_id, &archive_path, Some(progress_cb)).await?
            }
        }

        let extract_dir = temp_dir.path().join("extracted");
        std::fs::create_dir_all(&extract_dir)?;
        extract_zip(&archive_path, &extract_dir)?;

        let mut objects = Vec::new();
        for entry in WalkDir::new(&extract_dir).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) != Some("dcm") {
                continue;
            }
            let mut obj =
                dicom_object::open_file(entry.path()).map_err(|e| EventError::DicomObject(e.to_string()))?;

            let study_phi = obj
                .element(tags::STUDY_INSTANCE_UID)
                .ok()
                .and_then(|e| e.to_str().ok())
                .and_then(|uid| self.store.sessions().find_by_study_uid(&uid).ok().flatten())
                .map(|session| session.study_level_phi);
            let series_phi = obj
                .element(tags::SERIES_INSTANCE_UID)
                .ok()
                .and_then(|e| e.to_str().ok())
                .and_then(|uid| self.store.scans().find_by_series_uid(&uid).ok().flatten())
                .map(|scan| scan.series_level_phi);

            self.resolver
                .resolve_dataset(&mut obj, study_phi.as_ref(), series_phi.as_ref())
                .await?;
            obj.write_to_file(entry.path())
                .map_err(|e| EventError::DicomObject(e.to_string()))?;
            objects.push(obj);
        }

        let files_total = objects.len() as u32;
        let result = self.dispatcher.send_to_node(node, objects).await;
        let status = if result.error.is_none() && result.files_failed == 0 {
            "completed"
        } else {
            "failed"
        };
        let _ = self.outbox.send(dispatch_status_message(
            correlation_id.as_deref(),
            kind.as_str(),
            entity_id,
            &node.node_id,
            status,
            1.0,
            result.files_sent,
            files_total,
        ));

        Ok(())
    }

    async fn handle_config_refresh(&self) -> Result<(), EventError> {
        let config = self.backend.get_configuration().await?;
        let nodes: Vec<NodeConfig> = config
            .get("nodes")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e: serde_json::Error| EventError::MissingField(format!("nodes: {e}")))?
            .unwrap_or_default();
        let count = nodes.len();
        self.nodes.replace_all(nodes);
        info!(node_count = count, "node registry refreshed from backend configuration");
        Ok(())
    }

    fn handle_session_deleted(&self, event: &InboundEvent) -> Result<(), EventError> {
        let study_uid = event
            .entity_id
            .clone()
            .ok_or_else(|| EventError::MissingField("entity_id".to_string()))?;
        let sessions = self.store.sessions();
        let Some(session) = sessions.find_by_study_uid(&study_uid)? else {
            info!(study_uid = %study_uid, "session.deleted: no matching session, treating as already gone");
            return Ok(());
        };

        self.store.scans().delete_by_study_uid(&study_uid)?;
        sessions.delete(&study_uid)?;
        remove_storage_tree(&session.storage_path);
        self.delete_patient_mapping_if_orphaned(&session.patient_id)?;
        Ok(())
    }

    fn handle_scan_deleted(&self, event: &InboundEvent) -> Result<(), EventError> {
        let study_uid = event
            .entity_id
            .clone()
            .ok_or_else(|| EventError::MissingField("entity_id".to_string()))?;
        let Some(series_number) = event.series_number() else {
            return Err(EventError::MissingField("payload.series_number".to_string()));
        };

        let scans = self.store.scans();
        let Some(scan) = scans
            .find_by_study_uid(&study_uid)?
            .into_iter()
            .find(|s| s.series_number.as_deref() == Some(series_number.as_str()))
        else {
            info!(study_uid = %study_uid, series_number = %series_number, "scan.deleted: no matching scan, treating as already gone");
            return Ok(());
        };

        scans.delete(&scan.series_instance_uid)?;
        remove_storage_tree(&scan.storage_path);
        Ok(())
    }

    fn handle_subject_deleted(&self, event: &InboundEvent) -> Result<(), EventError> {
        let original_patient_id = event
            .entity_id
            .clone()
            .ok_or_else(|| EventError::MissingField("entity_id".to_string()))?;
        let mappings = self.store.mappings();
        let Some(mapping) = mappings.find_by_original_id(&original_patient_id)? else {
            info!(original_patient_id = %original_patient_id, "subject.deleted: no matching mapping, treating as already gone");
            return Ok(());
        };

        let sessions = self.store.sessions();
        for session in sessions.find_by_anonymous_patient_id(&mapping.anonymous_id)? {
            self.store.scans().delete_by_study_uid(&session.study_instance_uid)?;
            sessions.delete(&session.study_instance_uid)?;
            remove_storage_tree(&session.storage_path);
        }
        mappings.delete_by_original_id(&mapping.original_id)?;
        Ok(())
    }

    fn delete_patient_mapping_if_orphaned(&self, anonymous_patient_id: &str) -> Result<(), EventError> {
        let remaining = self.store.sessions().find_by_anonymous_patient_id(anonymous_patient_id)?;
        if !remaining.is_empty() {
            return Ok(());
        }
        if let Some(mapping) = self.store.mappings().find_by_anonymous_id(anonymous_patient_id)? {
            self.store.mappings().delete_by_original_id(&mapping.original_id)?;
        }
        Ok(())
    }
}

fn remove_storage_tree(path: &str) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path, error = %e, "failed to remove storage tree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_one_level_of_nesting() {
        let nested = json!({
            "data": {
                "payload": {
                    "event_type": "session.dispatch",
                    "entity_id": "1.2.3",
                    "payload": { "nodes": ["n1"] }
                }
            }
        });
        let event = InboundEvent::from_value(nested).unwrap();
        assert_eq!(event.event_type, "session.dispatch");
        assert_eq!(event.requested_nodes(), vec!["n1".to_string()]);
    }

    #[test]
    fn flat_envelope_parses_directly() {
        let flat = json!({ "event_type": "scan.new_scan_available", "entity_id": "scan-1" });
        let event = InboundEvent::from_value(flat).unwrap();
        assert_eq!(event.event_type, "scan.new_scan_available");
        assert!(event.requested_nodes().is_empty());
    }
}
