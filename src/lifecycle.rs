//! Service lifecycle (§5.14): wires every collaborator built in
//! [`crate::build_runtime`] into a running proxy — the `DimseHandlers`
//! bridge implementing the DICOM side of access control/PHI/staging, the
//! DICOM SCP's accept loop, the study monitor's ticker, and the
//! control-channel client — and coordinates graceful shutdown across all of
//! them.

use std::path::PathBuf;
use std::sync::Arc;

use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dimse::scp::MoveOutcome;
use dimse::types::SubOperationOutcome;
use dimse::{status, AssociationContext, DimseConfig, DimseError, DimseHandlers, DimseScp, QueryLevel};
use phi::{Anonymizer, PhiResolver};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::access::{AccessControl, Verb};
use crate::config::{Config, Mode, ProxyConfigurationHandle};
use crate::dispatch::ScuDispatcher;
use crate::models::PhiMap;
use crate::monitor::StudyMonitor;
use crate::nodes::NodeRegistry;
use crate::storage::{StageResult, StagingStore, StoreRequest};
use crate::ProxyRuntime;

/// Every instance this proxy persists is re-encoded Explicit VR Little
/// Endian on write, regardless of what was negotiated on the wire: nothing
/// downstream of `AssociationContext` surfaces the negotiated transfer
/// syntax to handlers, and re-encoding to one canonical syntax keeps the
/// staging store's on-disk files uniformly decodable.
const CANONICAL_TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2.1";

fn string_tag(obj: &InMemDicomObject<StandardDataDictionary>, tag: dicom_core::Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Bridges the proxy's access control, PHI and storage layers into the
/// `dimse` crate's wire-protocol-only `DimseHandlers` trait (§4.1-§4.3,
/// §4.12).
pub struct ProxyDimseHandlers {
    access: AccessControl,
    proxy_configuration: ProxyConfigurationHandle,
    nodes: Arc<NodeRegistry>,
    staging: Arc<StagingStore>,
    monitor: Arc<StudyMonitor>,
    anonymizer: Arc<Anonymizer>,
    resolver: Arc<PhiResolver>,
    dispatcher: Arc<ScuDispatcher>,
    store: crate::storage::ProxyStore,
}

impl ProxyDimseHandlers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        access: AccessControl,
        proxy_configuration: ProxyConfigurationHandle,
        nodes: Arc<NodeRegistry>,
        staging: Arc<StagingStore>,
        monitor: Arc<StudyMonitor>,
        anonymizer: Arc<Anonymizer>,
        resolver: Arc<PhiResolver>,
        dispatcher: Arc<ScuDispatcher>,
        store: crate::storage::ProxyStore,
    ) -> Self {
        Self {
            access,
            proxy_configuration,
            nodes,
            staging,
            monitor,
            anonymizer,
            resolver,
            dispatcher,
            store,
        }
    }

    fn mode(&self) -> Mode {
        self.proxy_configuration.load().mode
    }

    /// Gather every `.dcm` under the storage paths of the scans belonging to
    /// `study_uid` (or, for a series-level request, one scan), resolving PHI
    /// back in for the outbound copy (§4.9 dispatch mirrors the same idea).
    async fn load_outbound_objects(
        &self,
        level: QueryLevel,
        identifier: &InMemDicomObject<StandardDataDictionary>,
    ) -> Vec<InMemDicomObject<StandardDataDictionary>> {
        let Some(study_uid) = string_tag(identifier, tags::STUDY_INSTANCE_UID) else {
            return Vec::new();
        };

        let scans = match self.store.scans().find_by_study_uid(&study_uid) {
            Ok(scans) => scans,
            Err(e) => {
                error!(study_uid = %study_uid, error = %e, "failed to look up scans for outbound transfer");
                return Vec::new();
            }
        };

        let series_uid = string_tag(identifier, tags::SERIES_INSTANCE_UID);
        let session_phi = self
            .store
            .sessions()
            .find_by_study_uid(&study_uid)
            .ok()
            .flatten()
            .map(|s| s.study_level_phi);

        let mut objects = Vec::new();
        for scan in scans {
            if level == QueryLevel::Series {
                if series_uid.as_deref() != Some(scan.series_instance_uid.as_str()) {
                    continue;
                }
            }
            for entry in WalkDir::new(&scan.storage_path).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.path().extension().and_then(|e| e.to_str()) != Some("dcm") {
                    continue;
                }
                let Ok(mut obj) = dicom_object::open_file(entry.path()) else {
                    continue;
                };
                if self.proxy_configuration.load().enable_phi_anonymization {
                    if let Err(e) = self
                        .resolver
                        .resolve_dataset(&mut obj, session_phi.as_ref(), Some(&scan.series_level_phi))
                        .await
                    {
                        warn!(error = %e, "failed to resolve PHI for outbound object");
                    }
                }
                objects.push(obj);
            }
        }
        objects
    }

    async fn send_to_destination(
        &self,
        destination_ae: &str,
        objects: Vec<InMemDicomObject<StandardDataDictionary>>,
    ) -> MoveOutcome {
        if objects.is_empty() {
            return Vec::new();
        }
        let Some(node) = self.nodes.find_by_ae_title(destination_ae, None) else {
            return vec![SubOperationOutcome::Failed; objects.len()];
        };

        let total = objects.len();
        let result = self.dispatcher.send_to_node(&node, objects).await;
        let mut outcomes = vec![SubOperationOutcome::Completed; result.files_sent as usize];
        outcomes.extend(vec![
            SubOperationOutcome::Failed;
            total.saturating_sub(result.files_sent as usize)
        ]);
        outcomes
    }
}

#[async_trait::async_trait]
impl DimseHandlers for ProxyDimseHandlers {
    async fn on_store(
        &self,
        ctx: &AssociationContext,
        object: InMemDicomObject<StandardDataDictionary>,
    ) -> dimse::Result<u16> {
        let peer_ip = ctx.peer_addr.ip().to_string();
        if !self
            .access
            .check(self.mode(), Verb::Store, &ctx.calling_ae_title, &peer_ip)
            .is_allowed()
        {
            warn!(ae = %ctx.calling_ae_title, peer = %peer_ip, "C-STORE refused by access control");
            return Ok(status::REFUSED);
        }

        let mut dataset = object;
        let (patient_id, patient_name, study_phi, series_phi) =
            if self.proxy_configuration.load().enable_phi_anonymization {
                match self.anonymizer.anonymize_dataset(&mut dataset).await {
                    Ok(outcome) => (
                        outcome.mapping.anonymous_patient_id,
                        outcome.mapping.anonymous_patient_name,
                        outcome.study_phi,
                        outcome.series_phi,
                    ),
                    Err(e) => {
                        error!(error = %e, "PHI anonymization failed");
                        return Ok(status::PROCESSING_FAILURE);
                    }
                }
            } else {
                (
                    string_tag(&dataset, tags::PATIENT_ID).unwrap_or_default(),
                    string_tag(&dataset, tags::PATIENT_NAME).unwrap_or_default(),
                    PhiMap::new(),
                    PhiMap::new(),
                )
            };

        let Some(study_instance_uid) = string_tag(&dataset, tags::STUDY_INSTANCE_UID) else {
            return Ok(status::PROCESSING_FAILURE);
        };
        let Some(series_instance_uid) = string_tag(&dataset, tags::SERIES_INSTANCE_UID) else {
            return Ok(status::PROCESSING_FAILURE);
        };
        let Some(sop_instance_uid) = string_tag(&dataset, tags::SOP_INSTANCE_UID) else {
            return Ok(status::PROCESSING_FAILURE);
        };
        let modality = string_tag(&dataset, tags::MODALITY).unwrap_or_default();
        let study_date = string_tag(&dataset, tags::STUDY_DATE);
        let study_time = string_tag(&dataset, tags::STUDY_TIME);
        let study_description = string_tag(&dataset, tags::STUDY_DESCRIPTION);
        let accession_number = string_tag(&dataset, tags::ACCESSION_NUMBER);
        let series_number = string_tag(&dataset, tags::SERIES_NUMBER);
        let series_description = string_tag(&dataset, tags::SERIES_DESCRIPTION);

        let object = match dimse::wrap_with_file_meta(dataset, CANONICAL_TRANSFER_SYNTAX) {
            Ok(object) => object,
            Err(e) => {
                error!(error = %e, "failed to build file meta for stored instance");
                return Ok(status::PROCESSING_FAILURE);
            }
        };

        let request = StoreRequest {
            study_instance_uid: study_instance_uid.clone(),
            series_instance_uid,
            sop_instance_uid,
            transfer_syntax_uid: CANONICAL_TRANSFER_SYNTAX.to_string(),
            modality,
            patient_id,
            patient_name,
            study_date,
            study_time,
            study_description,
            accession_number,
            series_number,
            series_description,
            study_level_phi: study_phi,
            series_level_phi: series_phi,
            object,
        };

        let staging = self.staging.clone();
        let result: Result<StageResult, crate::storage::StorageError> =
            match tokio::task::spawn_blocking(move || staging.store_dicom_file(request)).await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "staging store task panicked");
                    return Ok(status::PROCESSING_FAILURE);
                }
            };

        match result {
            Ok(_) => {
                self.monitor.update_activity(&study_instance_uid);
                Ok(status::SUCCESS)
            }
            Err(e) => {
                error!(error = %e, "failed to stage C-STORE instance");
                Ok(status::PROCESSING_FAILURE)
            }
        }
    }

    async fn on_find(
        &self,
        ctx: &AssociationContext,
        level: QueryLevel,
        identifier: InMemDicomObject<StandardDataDictionary>,
    ) -> dimse::Result<Vec<(InMemDicomObject<StandardDataDictionary>, u16)>> {
        let peer_ip = ctx.peer_addr.ip().to_string();
        if !self
            .access
            .check(self.mode(), Verb::Find, &ctx.calling_ae_title, &peer_ip)
            .is_allowed()
        {
            return Ok(Vec::new());
        }

        let Some(study_uid) = string_tag(&identifier, tags::STUDY_INSTANCE_UID) else {
            return Ok(Vec::new());
        };
        let Some(session) = self
            .store
            .sessions()
            .find_by_study_uid(&study_uid)
            .map_err(|e| DimseError::internal(e.to_string()))?
        else {
            return Ok(Vec::new());
        };

        if level == QueryLevel::Study {
            let mut result = identifier.clone();
            put_str(&mut result, tags::STUDY_INSTANCE_UID, &session.study_instance_uid);
            put_str(&mut result, tags::PATIENT_ID, &session.patient_id);
            put_str(&mut result, tags::PATIENT_NAME, &session.patient_name);
            if let Some(v) = &session.study_date {
                put_str(&mut result, tags::STUDY_DATE, v);
            }
            if let Some(v) = &session.study_description {
                put_str(&mut result, tags::STUDY_DESCRIPTION, v);
            }
            return Ok(vec![(result, status::PENDING)]);
        }

        let scans = self
            .store
            .scans()
            .find_by_study_uid(&study_uid)
            .map_err(|e| DimseError::internal(e.to_string()))?;
        let mut matches = Vec::new();
        for scan in scans {
            let mut result = identifier.clone();
            put_str(&mut result, tags::STUDY_INSTANCE_UID, &scan.study_instance_uid);
            put_str(&mut result, tags::SERIES_INSTANCE_UID, &scan.series_instance_uid);
            put_str(&mut result, tags::MODALITY, &scan.modality);
            matches.push((result, status::PENDING));
        }
        Ok(matches)
    }

    async fn on_get(
        &self,
        ctx: &AssociationContext,
        level: QueryLevel,
        identifier: InMemDicomObject<StandardDataDictionary>,
    ) -> dimse::Result<MoveOutcome> {
        let peer_ip = ctx.peer_addr.ip().to_string();
        if !self
            .access
            .check(self.mode(), Verb::Get, &ctx.calling_ae_title, &peer_ip)
            .is_allowed()
        {
            return Ok(Vec::new());
        }
        let objects = self.load_outbound_objects(level, &identifier).await;
        Ok(self.send_to_destination(&ctx.calling_ae_title, objects).await)
    }

    async fn on_move(
        &self,
        ctx: &AssociationContext,
        level: QueryLevel,
        destination_ae: &str,
        identifier: InMemDicomObject<StandardDataDictionary>,
    ) -> dimse::Result<MoveOutcome> {
        let peer_ip = ctx.peer_addr.ip().to_string();
        if !self
            .access
            .check(self.mode(), Verb::Move, &ctx.calling_ae_title, &peer_ip)
            .is_allowed()
        {
            return Ok(Vec::new());
        }
        if !self.access.check_move_destination(destination_ae).is_allowed() {
            return Ok(Vec::new());
        }
        let objects = self.load_outbound_objects(level, &identifier).await;
        Ok(self.send_to_destination(destination_ae, objects).await)
    }
}

fn put_str(obj: &mut InMemDicomObject<StandardDataDictionary>, tag: dicom_core::Tag, value: &str) {
    let vr = obj.element(tag).ok().map(|e| e.header().vr()).unwrap_or(dicom_core::VR::LO);
    obj.put(dicom_core::DataElement::new(tag, vr, dicom_core::PrimitiveValue::from(value)));
}

fn to_dimse_config(config: &Config, nodes_storage_dir: PathBuf) -> DimseConfig {
    let bind_addr = config
        .proxy
        .bind_address
        .parse()
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    DimseConfig {
        local_aet: config.proxy.ae_title.clone(),
        bind_addr,
        port: config.proxy.port,
        storage_dir: nodes_storage_dir,
        ..DimseConfig::default()
    }
}

/// Owns every long-running task started for one proxy process and
/// coordinates shutting them down together.
pub struct ProxyService {
    scp_handle: tokio::task::JoinHandle<dimse::Result<()>>,
    monitor_handle: tokio::task::JoinHandle<()>,
    control_handle: tokio::task::JoinHandle<()>,
    shutdown: CancellationToken,
    outbox: UnboundedSender<serde_json::Value>,
}

impl ProxyService {
    /// Build and start the DICOM SCP, study monitor ticker and control
    /// channel client from an assembled [`ProxyRuntime`].
    pub fn spawn(runtime: ProxyRuntime) -> Self {
        let shutdown = CancellationToken::new();
        let snapshot = runtime.proxy_configuration.load();

        let access = AccessControl::new(runtime.nodes.clone());
        let staging_root = PathBuf::from(&runtime.config.proxy.store_dir).join("instances");
        let staging = Arc::new(StagingStore::new(staging_root, runtime.store.clone()));

        let mapping_store: Arc<dyn phi::PatientMappingStore> = Arc::new(
            crate::phi_store::RedbPatientMappingStore::new(runtime.store.mappings()),
        );
        let anonymizer = Arc::new(Anonymizer::new(mapping_store.clone()));
        let resolver = Arc::new(PhiResolver::new(mapping_store));

        let dispatcher = Arc::new(ScuDispatcher::new(snapshot.ae_title.clone()));

        let handlers = Arc::new(ProxyDimseHandlers::new(
            access.clone(),
            runtime.proxy_configuration.clone(),
            runtime.nodes.clone(),
            staging,
            runtime.monitor.clone(),
            anonymizer.clone(),
            resolver.clone(),
            dispatcher.clone(),
            runtime.store.clone(),
        ));

        let dimse_storage_dir = PathBuf::from(&runtime.config.proxy.store_dir).join("dimse-tmp");
        let dimse_config = to_dimse_config(&runtime.config, dimse_storage_dir);
        let scp = DimseScp::new(dimse_config, handlers.clone() as Arc<dyn DimseHandlers>);
        let scp_handle = tokio::spawn(scp.run());

        let monitor_handle = runtime.monitor.clone().spawn(shutdown.clone());

        let (outbox_tx, outbox_rx) = tokio::sync::mpsc::unbounded_channel();
        let work_dir = PathBuf::from(&runtime.config.proxy.store_dir).join("dispatch-work");
        let _ = std::fs::create_dir_all(&work_dir);
        let events = Arc::new(crate::events::EventHandlers::new(
            runtime.nodes.clone(),
            runtime.locks.clone(),
            runtime.backend.clone(),
            runtime.store.clone(),
            dispatcher.clone(),
            resolver,
            outbox_tx.clone(),
            work_dir,
        ));

        let control_config = crate::control::ControlChannelConfig::from_proxy_config(&runtime.config.proxy);
        let control_handle = crate::control::spawn(
            control_config,
            runtime.proxy_configuration.clone(),
            runtime.nodes.clone(),
            dispatcher,
            events,
            outbox_rx,
            shutdown.clone(),
        );

        info!("proxy service fully assembled and running");

        Self {
            scp_handle,
            monitor_handle,
            control_handle,
            shutdown,
            outbox: outbox_tx,
        }
    }

    /// Request shutdown, letting the control channel send its final offline
    /// `health_update` before everything is torn down.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        drop(self.outbox);

        let timeout = std::time::Duration::from_secs(10);
        if tokio::time::timeout(timeout, self.control_handle).await.is_err() {
            warn!("control channel did not shut down within timeout");
        }
        if tokio::time::timeout(timeout, self.monitor_handle).await.is_err() {
            warn!("study monitor did not shut down within timeout");
        }
        self.scp_handle.abort();
        info!("proxy service shut down");
    }
}
