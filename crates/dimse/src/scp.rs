//! Service Class Provider: accepts inbound associations over a native
//! `dicom-ul` connection and dispatches DIMSE commands to caller-supplied
//! handlers. One Tokio task per association; handlers never share state
//! across associations.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::{association::ServerAssociationOptions, Pdu};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::DimseConfig;
use crate::types::{status, QueryLevel, SubOperationCounters, SubOperationOutcome};
use crate::{DimseError, Result};

/// Storage SOP classes this proxy accepts on C-STORE.
#[allow(deprecated)]
pub static STORAGE_ABSTRACT_SYNTAXES: &[&str] = &[
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_COLOR_IMAGE_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::ENHANCED_PET_IMAGE_STORAGE,
];

/// Query/Retrieve Information Model roots this proxy negotiates, in both the
/// Patient Root and Study Root flavors, plus Verification.
pub static QUERY_RETRIEVE_ABSTRACT_SYNTAXES: &[&str] = &[
    uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
    uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
    uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
    uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
    uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
    uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
];

const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
const NUMBER_OF_REMAINING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1020);
const NUMBER_OF_COMPLETED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1021);
const NUMBER_OF_FAILED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1022);
const NUMBER_OF_WARNING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1023);

const C_STORE_RQ: u16 = 0x0001;
const C_GET_RQ: u16 = 0x0010;
const C_FIND_RQ: u16 = 0x0020;
const C_MOVE_RQ: u16 = 0x0021;
const C_ECHO_RQ: u16 = 0x0030;
const C_STORE_RSP: u16 = 0x8001;
const C_GET_RSP: u16 = 0x8010;
const C_FIND_RSP: u16 = 0x8020;
const C_MOVE_RSP: u16 = 0x8021;
const C_ECHO_RSP: u16 = 0x8030;

/// Per-association identity, extracted once at negotiation time and handed
/// to every handler invocation for that association.
#[derive(Debug, Clone)]
pub struct AssociationContext {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub peer_addr: SocketAddr,
}

/// Per-sub-operation result of a dispatched C-GET/C-MOVE transfer, rolled up
/// into the response's sub-operation counters.
pub type MoveOutcome = Vec<SubOperationOutcome>;

/// Application hooks invoked per DIMSE message on the association's worker.
/// Implementations own access control, PHI transforms and persistence; this
/// module only speaks the wire protocol. C-ECHO is handled by the SCP
/// itself and always reports success when `DimseConfig::enable_echo` is set.
#[async_trait]
pub trait DimseHandlers: Send + Sync {
    /// A C-STORE-RQ dataset arrived. Returns the status to report back
    /// (`status::SUCCESS`, `status::REFUSED` for access-control or unknown
    /// modality, `status::PROCESSING_FAILURE` for internal errors).
    async fn on_store(&self, ctx: &AssociationContext, object: InMemDicomObject<StandardDataDictionary>) -> Result<u16>;

    /// A C-FIND-RQ identifier arrived. Returns each match paired with the
    /// status to send with it (normally `status::PENDING`); the SCP appends
    /// the final `status::SUCCESS` response itself.
    async fn on_find(
        &self,
        ctx: &AssociationContext,
        level: QueryLevel,
        identifier: InMemDicomObject<StandardDataDictionary>,
    ) -> Result<Vec<(InMemDicomObject<StandardDataDictionary>, u16)>>;

    /// A C-GET-RQ identifier arrived. This proxy does not stream C-STORE
    /// sub-operations back over the same association; implementations
    /// dispatch the transfer through the SCU dispatcher and report the
    /// resulting per-instance outcomes.
    async fn on_get(
        &self,
        ctx: &AssociationContext,
        level: QueryLevel,
        identifier: InMemDicomObject<StandardDataDictionary>,
    ) -> Result<MoveOutcome>;

    /// A C-MOVE-RQ identifier arrived, destined for `destination_ae`.
    async fn on_move(
        &self,
        ctx: &AssociationContext,
        level: QueryLevel,
        destination_ae: &str,
        identifier: InMemDicomObject<StandardDataDictionary>,
    ) -> Result<MoveOutcome>;
}

/// DIMSE Service Class Provider.
pub struct DimseScp {
    config: DimseConfig,
    handlers: Arc<dyn DimseHandlers>,
}

struct PendingCommand {
    command_field: u16,
    message_id: u16,
    affected_sop_class_uid: Option<String>,
    affected_sop_instance_uid: Option<String>,
    move_destination: Option<String>,
}

impl DimseScp {
    pub fn new(config: DimseConfig, handlers: Arc<dyn DimseHandlers>) -> Self {
        Self { config, handlers }
    }

    /// Bind the configured address and accept associations until the process
    /// is stopped. Each association is handled on its own Tokio task.
    pub async fn run(self) -> Result<()> {
        self.config.validate()?;
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, aet = %self.config.local_aet, "DIMSE SCP listening");

        let scp = Arc::new(self);
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            let scp = Arc::clone(&scp);
            tokio::spawn(async move {
                if let Err(e) = scp.handle_association(stream, peer_addr).await {
                    warn!(%peer_addr, error = %e, "association ended with error");
                }
            });
        }
    }

    fn build_options(&self) -> ServerAssociationOptions<'static> {
        let mut options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title(self.config.local_aet.clone())
            .max_pdu_length(self.config.max_pdu);

        for ts in TransferSyntaxRegistry.iter() {
            if !ts.is_unsupported() {
                options = options.with_transfer_syntax(ts.uid());
            }
        }

        if self.config.enable_echo {
            options = options.with_abstract_syntax(uids::VERIFICATION);
        }
        for uid in STORAGE_ABSTRACT_SYNTAXES {
            options = options.with_abstract_syntax(*uid);
        }
        if self.config.enable_find || self.config.enable_move || self.config.enable_get {
            for uid in QUERY_RETRIEVE_ABSTRACT_SYNTAXES {
                options = options.with_abstract_syntax(*uid);
            }
        }

        options
    }

    /// Runs the full PDU loop for one association: negotiation, command and
    /// dataset exchange, and release/abort handling. The association's
    /// concrete type is whatever `establish_async` returns, inferred locally
    /// so this method never has to name it.
    async fn handle_association(
        &self,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let options = self.build_options();
        let mut association = options
            .establish_async(stream)
            .await
            .map_err(|e| DimseError::dicom_ul(e.to_string()))?;

        let ctx = AssociationContext {
            calling_ae_title: association.client_ae_title().trim().to_string(),
            called_ae_title: self.config.local_aet.clone(),
            peer_addr,
        };
        info!(ae = %ctx.calling_ae_title, %peer_addr, "association established");

        macro_rules! send_pdu {
            ($value_type:expr, $pc_id:expr, $data:expr) => {{
                let pdu = Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id: $pc_id,
                        value_type: $value_type,
                        is_last: true,
                        data: $data,
                    }],
                };
                association
                    .send(&pdu)
                    .await
                    .map_err(|e| DimseError::dicom_ul(e.to_string()))
            }};
        }

        let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
        let mut pending: Option<PendingCommand> = None;

        loop {
            let pdu = match association.receive().await {
                Ok(pdu) => pdu,
                Err(dicom_ul::association::server::Error::Receive { .. }) => {
                    debug!(ae = %ctx.calling_ae_title, "peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(ae = %ctx.calling_ae_title, error = %e, "unexpected association error");
                    break;
                }
            };

            match pdu {
                Pdu::PData { data } => {
                    for value in data {
                        match value.value_type {
                            PDataValueType::Command if value.is_last => {
                                let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
                                let obj = InMemDicomObject::read_dataset_with_ts(
                                    value.data.as_slice(),
                                    &ts,
                                )
                                .map_err(|e| DimseError::dicom_object(e.to_string()))?;
                                let parsed = parse_command(&obj)?;
                                instance_buffer.clear();

                                if parsed.command_field == C_ECHO_RQ {
                                    let response_status = if self.config.enable_echo {
                                        status::SUCCESS
                                    } else {
                                        status::REFUSED
                                    };
                                    let rsp = build_simple_response(
                                        C_ECHO_RSP,
                                        parsed.message_id,
                                        parsed.affected_sop_class_uid.as_deref().unwrap_or(""),
                                        None,
                                        response_status,
                                    );
                                    let encoded = encode_command(&rsp)?;
                                    send_pdu!(
                                        PDataValueType::Command,
                                        value.presentation_context_id,
                                        encoded
                                    )?;
                                } else {
                                    pending = Some(parsed);
                                }
                            }
                            PDataValueType::Data if !value.is_last => {
                                instance_buffer.extend_from_slice(&value.data);
                            }
                            PDataValueType::Data if value.is_last => {
                                instance_buffer.extend_from_slice(&value.data);
                                let Some(command) = pending.take() else {
                                    warn!("received dataset fragment with no pending command");
                                    instance_buffer.clear();
                                    continue;
                                };

                                let pc_transfer_syntax = association
                                    .presentation_contexts()
                                    .iter()
                                    .find(|pc| pc.id == value.presentation_context_id)
                                    .map(|pc| pc.transfer_syntax.clone())
                                    .ok_or_else(|| {
                                        DimseError::dicom_ul("missing presentation context")
                                    })?;
                                let ts = TransferSyntaxRegistry
                                    .get(&pc_transfer_syntax)
                                    .ok_or_else(|| {
                                        DimseError::dicom_ul("unregistered transfer syntax")
                                    })?;

                                let dataset = InMemDicomObject::read_dataset_with_ts(
                                    instance_buffer.as_slice(),
                                    ts,
                                )
                                .map_err(|e| DimseError::dicom_object(e.to_string()))?;
                                instance_buffer.clear();
                                let pc_id = value.presentation_context_id;

                                match command.command_field {
                                    C_STORE_RQ => {
                                        let sop_instance_uid =
                                            command.affected_sop_instance_uid.clone();
                                        let sop_class_uid = command
                                            .affected_sop_class_uid
                                            .clone()
                                            .unwrap_or_default();
                                        let result_status =
                                            match self.handlers.on_store(&ctx, dataset).await {
                                                Ok(status) => status,
                                                Err(e) => {
                                                    error!(ae = %ctx.calling_ae_title, error = %e, "on_store failed");
                                                    status::PROCESSING_FAILURE
                                                }
                                            };
                                        let rsp = build_simple_response(
                                            C_STORE_RSP,
                                            command.message_id,
                                            &sop_class_uid,
                                            sop_instance_uid.as_deref(),
                                            result_status,
                                        );
                                        let encoded = encode_command(&rsp)?;
                                        send_pdu!(PDataValueType::Command, pc_id, encoded)?;
                                    }
                                    C_FIND_RQ => {
                                        if !self.config.enable_find {
                                            let rsp = build_simple_response(
                                                C_FIND_RSP,
                                                command.message_id,
                                                command
                                                    .affected_sop_class_uid
                                                    .as_deref()
                                                    .unwrap_or(""),
                                                None,
                                                status::REFUSED,
                                            );
                                            let encoded = encode_command(&rsp)?;
                                            send_pdu!(PDataValueType::Command, pc_id, encoded)?;
                                            continue;
                                        }
                                        let level = query_retrieve_level(&dataset)?;
                                        let matches = self
                                            .handlers
                                            .on_find(&ctx, level, dataset)
                                            .await
                                            .unwrap_or_else(|e| {
                                                error!(ae = %ctx.calling_ae_title, error = %e, "on_find failed");
                                                Vec::new()
                                            });

                                        for (identifier, match_status) in &matches {
                                            let rsp = build_simple_response(
                                                C_FIND_RSP,
                                                command.message_id,
                                                command
                                                    .affected_sop_class_uid
                                                    .as_deref()
                                                    .unwrap_or(""),
                                                None,
                                                *match_status,
                                            );
                                            let encoded = encode_command(&rsp)?;
                                            send_pdu!(PDataValueType::Command, pc_id, encoded)?;
                                            let mut encoded_identifier = Vec::new();
                                            identifier
                                                .write_dataset_with_ts(&mut encoded_identifier, ts)
                                                .map_err(|e| {
                                                    DimseError::dicom_object(e.to_string())
                                                })?;
                                            send_pdu!(
                                                PDataValueType::Data,
                                                pc_id,
                                                encoded_identifier
                                            )?;
                                        }

                                        let rsp = build_simple_response(
                                            C_FIND_RSP,
                                            command.message_id,
                                            command.affected_sop_class_uid.as_deref().unwrap_or(""),
                                            None,
                                            status::SUCCESS,
                                        );
                                        let encoded = encode_command(&rsp)?;
                                        send_pdu!(PDataValueType::Command, pc_id, encoded)?;
                                    }
                                    C_MOVE_RQ => {
                                        if !self.config.enable_move {
                                            let rsp = build_move_response(
                                                C_MOVE_RSP,
                                                command.message_id,
                                                command
                                                    .affected_sop_class_uid
                                                    .as_deref()
                                                    .unwrap_or(""),
                                                status::REFUSED,
                                                SubOperationCounters::default(),
                                            );
                                            let encoded = encode_command(&rsp)?;
                                            send_pdu!(PDataValueType::Command, pc_id, encoded)?;
                                            continue;
                                        }
                                        let Some(destination_ae) = command.move_destination.clone()
                                        else {
                                            let rsp = build_move_response(
                                                C_MOVE_RSP,
                                                command.message_id,
                                                command
                                                    .affected_sop_class_uid
                                                    .as_deref()
                                                    .unwrap_or(""),
                                                status::MOVE_DESTINATION_UNKNOWN,
                                                SubOperationCounters::default(),
                                            );
                                            let encoded = encode_command(&rsp)?;
                                            send_pdu!(PDataValueType::Command, pc_id, encoded)?;
                                            continue;
                                        };
                                        let level = query_retrieve_level(&dataset)?;
                                        let outcomes = self
                                            .handlers
                                            .on_move(&ctx, level, &destination_ae, dataset)
                                            .await
                                            .unwrap_or_else(|e| {
                                                error!(ae = %ctx.calling_ae_title, error = %e, "on_move failed");
                                                Vec::new()
                                            });
                                        let (final_status, counters) =
                                            summarize_sub_operations(&outcomes);
                                        let rsp = build_move_response(
                                            C_MOVE_RSP,
                                            command.message_id,
                                            command.affected_sop_class_uid.as_deref().unwrap_or(""),
                                            final_status,
                                            counters,
                                        );
                                        let encoded = encode_command(&rsp)?;
                                        send_pdu!(PDataValueType::Command, pc_id, encoded)?;
                                    }
                                    C_GET_RQ => {
                                        if !self.config.enable_get {
                                            let rsp = build_move_response(
                                                C_GET_RSP,
                                                command.message_id,
                                                command
                                                    .affected_sop_class_uid
                                                    .as_deref()
                                                    .unwrap_or(""),
                                                status::REFUSED,
                                                SubOperationCounters::default(),
                                            );
                                            let encoded = encode_command(&rsp)?;
                                            send_pdu!(PDataValueType::Command, pc_id, encoded)?;
                                            continue;
                                        }
                                        let level = query_retrieve_level(&dataset)?;
                                        let outcomes = self
                                            .handlers
                                            .on_get(&ctx, level, dataset)
                                            .await
                                            .unwrap_or_else(|e| {
                                                error!(ae = %ctx.calling_ae_title, error = %e, "on_get failed");
                                                Vec::new()
                                            });
                                        let (final_status, counters) =
                                            summarize_sub_operations(&outcomes);
                                        let rsp = build_move_response(
                                            C_GET_RSP,
                                            command.message_id,
                                            command.affected_sop_class_uid.as_deref().unwrap_or(""),
                                            final_status,
                                            counters,
                                        );
                                        let encoded = encode_command(&rsp)?;
                                        send_pdu!(PDataValueType::Command, pc_id, encoded)?;
                                    }
                                    other => {
                                        warn!(
                                            command_field = format!("{other:#06x}"),
                                            "unsupported DIMSE command"
                                        );
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    if let Err(e) = association.send(&Pdu::ReleaseRP).await {
                        warn!(error = %e, "failed to send release response");
                    }
                    info!(ae = %ctx.calling_ae_title, "association released");
                    break;
                }
                Pdu::AbortRQ { source } => {
                    warn!(ae = %ctx.calling_ae_title, ?source, "association aborted by peer");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn parse_command(obj: &InMemDicomObject<StandardDataDictionary>) -> Result<PendingCommand> {
    let command_field = obj
        .element(tags::COMMAND_FIELD)
        .map_err(|e| DimseError::dicom_object(e.to_string()))?
        .to_int::<u16>()
        .map_err(|e| DimseError::dicom_object(e.to_string()))?;
    let message_id = obj
        .element(tags::MESSAGE_ID)
        .map_err(|e| DimseError::dicom_object(e.to_string()))?
        .to_int::<u16>()
        .map_err(|e| DimseError::dicom_object(e.to_string()))?;
    let affected_sop_class_uid = obj
        .element(tags::AFFECTED_SOP_CLASS_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').to_string());
    let affected_sop_instance_uid = obj
        .element(tags::AFFECTED_SOP_INSTANCE_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').to_string());
    let move_destination = obj
        .element(MOVE_DESTINATION)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string());

    Ok(PendingCommand {
        command_field,
        message_id,
        affected_sop_class_uid,
        affected_sop_instance_uid,
        move_destination,
    })
}

fn query_retrieve_level(identifier: &InMemDicomObject<StandardDataDictionary>) -> Result<QueryLevel> {
    let raw = identifier
        .element(tags::QUERY_RETRIEVE_LEVEL)
        .map_err(|e| DimseError::dicom_object(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::dicom_object(e.to_string()))?;
    raw.parse()
}

fn summarize_sub_operations(outcomes: &[SubOperationOutcome]) -> (u16, SubOperationCounters) {
    let mut counters = SubOperationCounters::default();
    for outcome in outcomes {
        match outcome {
            SubOperationOutcome::Completed => counters.completed += 1,
            SubOperationOutcome::Failed => counters.failed += 1,
            SubOperationOutcome::Warning => counters.warning += 1,
        }
    }
    let final_status = if counters.failed > 0 && counters.completed > 0 {
        status::SUB_OPERATIONS_COMPLETE_WITH_FAILURES
    } else if counters.failed > 0 {
        status::PROCESSING_FAILURE
    } else {
        status::SUCCESS
    };
    (final_status, counters)
}

fn build_simple_response(
    command_field_rsp: u16,
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: Option<&str>,
    response_status: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    let mut elements = vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command_field_rsp]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response_status])),
    ];
    if let Some(sop_instance_uid) = sop_instance_uid {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ));
    }
    InMemDicomObject::command_from_element_iter(elements)
}

fn build_move_response(
    command_field_rsp: u16,
    message_id: u16,
    sop_class_uid: &str,
    response_status: u16,
    counters: SubOperationCounters,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter(vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command_field_rsp]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response_status])),
        DataElement::new(
            NUMBER_OF_REMAINING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [counters.remaining as u16]),
        ),
        DataElement::new(
            NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [counters.completed as u16]),
        ),
        DataElement::new(
            NUMBER_OF_FAILED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [counters.failed as u16]),
        ),
        DataElement::new(
            NUMBER_OF_WARNING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [counters.warning as u16]),
        ),
    ])
}

fn encode_command(command: &InMemDicomObject<StandardDataDictionary>) -> Result<Vec<u8>> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(&mut data, &ts)
        .map_err(|e| DimseError::dicom_object(e.to_string()))?;
    Ok(data)
}

/// Build a file-meta-wrapped object suitable for persistence, from a dataset
/// read off the wire with its negotiated transfer syntax UID.
pub fn wrap_with_file_meta(
    dataset: InMemDicomObject<StandardDataDictionary>,
    transfer_syntax_uid: &str,
) -> Result<InMemDicomObject<StandardDataDictionary>> {
    let sop_class_uid = dataset
        .element(tags::SOP_CLASS_UID)
        .map_err(|e| DimseError::dicom_object(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::dicom_object(e.to_string()))?
        .to_string();
    let sop_instance_uid = dataset
        .element(tags::SOP_INSTANCE_UID)
        .map_err(|e| DimseError::dicom_object(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::dicom_object(e.to_string()))?
        .to_string();

    let file_meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(transfer_syntax_uid)
        .build()
        .map_err(|e| DimseError::dicom_object(e.to_string()))?;

    Ok(dataset.with_exact_meta(file_meta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_response_carries_status_and_ids() {
        let rsp = build_simple_response(
            C_STORE_RSP,
            7,
            uids::CT_IMAGE_STORAGE,
            Some("1.2.3.4"),
            status::SUCCESS,
        );
        assert_eq!(
            rsp.element(tags::STATUS).unwrap().to_int::<u16>().unwrap(),
            status::SUCCESS
        );
        assert_eq!(
            rsp.element(tags::MESSAGE_ID_BEING_RESPONDED_TO)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            7
        );
        assert_eq!(
            rsp.element(tags::AFFECTED_SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap(),
            "1.2.3.4"
        );
    }

    #[test]
    fn move_response_reports_sub_operation_counters() {
        let counters = SubOperationCounters {
            remaining: 0,
            completed: 3,
            failed: 1,
            warning: 0,
        };
        let rsp = build_move_response(
            C_MOVE_RSP,
            1,
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            status::SUB_OPERATIONS_COMPLETE_WITH_FAILURES,
            counters,
        );
        assert_eq!(
            rsp.element(NUMBER_OF_COMPLETED_SUBOPERATIONS)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            3
        );
        assert_eq!(
            rsp.element(NUMBER_OF_FAILED_SUBOPERATIONS)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            1
        );
    }

    #[test]
    fn summarize_mixed_outcomes_reports_partial_failure() {
        let outcomes = vec![
            SubOperationOutcome::Completed,
            SubOperationOutcome::Completed,
            SubOperationOutcome::Failed,
        ];
        let (final_status, counters) = summarize_sub_operations(&outcomes);
        assert_eq!(final_status, status::SUB_OPERATIONS_COMPLETE_WITH_FAILURES);
        assert_eq!(counters.completed, 2);
        assert_eq!(counters.failed, 1);
    }

    #[test]
    fn summarize_all_success_reports_success() {
        let outcomes = vec![SubOperationOutcome::Completed, SubOperationOutcome::Completed];
        let (final_status, _) = summarize_sub_operations(&outcomes);
        assert_eq!(final_status, status::SUCCESS);
    }
}
