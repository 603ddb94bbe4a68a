//! Service Class User (SCU) implementation for outbound DIMSE operations.
//!
//! Used by the proxy's dispatch path to forward anonymized instances to
//! downstream DICOM nodes and to verify node reachability with C-ECHO. One
//! association is opened per `store_many`/`echo` call and released (or
//! aborted, on transport error) before returning.

use std::collections::HashSet;
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::{association::ClientAssociationOptions, ClientAssociation, Pdu};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::config::{DimseConfig, RemoteNode};
use crate::types::{status, SubOperationCounters, SubOperationOutcome};
use crate::{DimseError, Result};

const C_ECHO_RQ: u16 = 0x0030;
const C_ECHO_RSP: u16 = 0x8030;
const C_STORE_RQ: u16 = 0x0001;
const C_STORE_RSP: u16 = 0x8001;

/// DIMSE Service Class User.
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration.
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    /// Send a C-ECHO request to a remote node. Used both as a standalone
    /// health probe and as the verify-only mode of the dispatcher.
    pub async fn echo(&self, node: &RemoteNode) -> Result<bool> {
        node.validate()?;
        info!(ae = %node.ae_title, host = %node.host, port = node.port, "sending C-ECHO");

        let mut association = self.associate(node, &[uids::VERIFICATION]).await?;
        let pc_id = association
            .presentation_contexts()
            .first()
            .map(|pc| pc.id)
            .ok_or_else(|| DimseError::dicom_ul("peer rejected all presentation contexts"))?;

        let command = build_echo_request(1);
        send_command(&mut association, pc_id, &command).await?;

        let response = receive_command(&mut association).await?;
        let response_status = response
            .element(tags::STATUS)
            .map_err(|e| DimseError::dicom_object(e.to_string()))?
            .to_int::<u16>()
            .map_err(|e| DimseError::dicom_object(e.to_string()))?;

        release(&mut association).await;
        Ok(response_status == status::SUCCESS)
    }

    /// Send a batch of instances to a remote node over a single association,
    /// one C-STORE per instance, in order. Transfer syntax is negotiated per
    /// the instance's own SOP class; the caller is responsible for having
    /// already run the PHI resolver and populated file meta information.
    pub async fn store_many(
        &self,
        node: &RemoteNode,
        objects: Vec<InMemDicomObject<StandardDataDictionary>>,
    ) -> Result<SubOperationCounters> {
        node.validate()?;
        if objects.is_empty() {
            return Ok(SubOperationCounters::default());
        }

        let sop_classes: HashSet<String> = objects
            .iter()
            .filter_map(|obj| {
                obj.element(tags::SOP_CLASS_UID)
                    .ok()
                    .and_then(|e| e.to_str().ok())
                    .map(|s| s.trim_end_matches('\0').to_string())
            })
            .collect();
        let abstract_syntaxes: Vec<&str> = sop_classes.iter().map(String::as_str).collect();

        let mut association = self.associate(node, &abstract_syntaxes).await?;
        let mut counters = SubOperationCounters {
            remaining: objects.len() as u32,
            ..Default::default()
        };

        for (idx, object) in objects.into_iter().enumerate() {
            let message_id = (idx + 1) as u16;
            let outcome = match self
                .store_one(&mut association, message_id, &object)
                .await
            {
                Ok(SubOperationOutcome::Completed) => SubOperationOutcome::Completed,
                Ok(other) => other,
                Err(e) => {
                    error!(ae = %node.ae_title, error = %e, "C-STORE sub-operation failed");
                    SubOperationOutcome::Failed
                }
            };
            counters.record(outcome);
        }

        release(&mut association).await;
        Ok(counters)
    }

    async fn store_one(
        &self,
        association: &mut ClientAssociation<TcpStream>,
        message_id: u16,
        object: &InMemDicomObject<StandardDataDictionary>,
    ) -> Result<SubOperationOutcome> {
        let sop_class_uid = object
            .element(tags::SOP_CLASS_UID)
            .map_err(|e| DimseError::dicom_object(e.to_string()))?
            .to_str()
            .map_err(|e| DimseError::dicom_object(e.to_string()))?
            .trim_end_matches('\0')
            .to_string();
        let sop_instance_uid = object
            .element(tags::SOP_INSTANCE_UID)
            .map_err(|e| DimseError::dicom_object(e.to_string()))?
            .to_str()
            .map_err(|e| DimseError::dicom_object(e.to_string()))?
            .trim_end_matches('\0')
            .to_string();

        let (pc_id, pc_transfer_syntax) = association
            .presentation_contexts()
            .iter()
            .find(|pc| TransferSyntaxRegistry.get(&pc.transfer_syntax).is_some())
            .map(|pc| (pc.id, pc.transfer_syntax.clone()))
            .ok_or_else(|| DimseError::dicom_ul("no usable presentation context for instance"))?;
        let ts = TransferSyntaxRegistry
            .get(&pc_transfer_syntax)
            .ok_or_else(|| DimseError::dicom_ul("unregistered transfer syntax"))?;

        let command = build_store_request(&sop_class_uid, &sop_instance_uid, message_id);
        let mut command_data = Vec::with_capacity(128);
        command
            .write_dataset_with_ts(
                &mut command_data,
                &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )
            .map_err(|e| DimseError::dicom_object(e.to_string()))?;

        let mut object_data = Vec::with_capacity(4096);
        object
            .write_dataset_with_ts(&mut object_data, ts)
            .map_err(|e| DimseError::dicom_object(e.to_string()))?;

        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: pc_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: command_data,
                },
                PDataValue {
                    presentation_context_id: pc_id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: object_data,
                },
            ],
        };
        association
            .send(&pdu)
            .await
            .map_err(|e| DimseError::dicom_ul(e.to_string()))?;

        let response = receive_command(association).await?;
        let response_status = response
            .element(tags::STATUS)
            .map_err(|e| DimseError::dicom_object(e.to_string()))?
            .to_int::<u16>()
            .map_err(|e| DimseError::dicom_object(e.to_string()))?;

        match response_status {
            status::SUCCESS => {
                debug!(sop_instance_uid = %sop_instance_uid, "C-STORE accepted");
                Ok(SubOperationOutcome::Completed)
            }
            other => {
                warn!(sop_instance_uid = %sop_instance_uid, status = format!("{other:#06x}"), "C-STORE refused");
                Ok(SubOperationOutcome::Failed)
            }
        }
    }

    async fn associate(
        &self,
        node: &RemoteNode,
        abstract_syntaxes: &[&str],
    ) -> Result<ClientAssociation<TcpStream>> {
        let max_pdu = node.max_pdu.unwrap_or(self.config.max_pdu);
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.config.local_aet.clone())
            .called_ae_title(node.ae_title.clone())
            .max_pdu_length(max_pdu);

        for uid in abstract_syntaxes {
            options = options.with_abstract_syntax(*uid);
        }

        let addr = format!("{}:{}", node.host, node.port);
        let connect_timeout = node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout());

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DimseError::Timeout(format!("connecting to {addr}")))??;

        options
            .establish_async(stream)
            .await
            .map_err(|e| DimseError::dicom_ul(e.to_string()))
    }

    /// Test connectivity to a remote node with retry logic.
    pub async fn test_connection(&self, node: &RemoteNode, max_retries: u32) -> Result<bool> {
        let mut retries = 0;

        loop {
            if retries > 0 {
                info!("Connection test retry {} of {}", retries, max_retries);
                tokio::time::sleep(Duration::from_secs(1 << retries)).await;
            }

            match self.echo(node).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_recoverable() && retries < max_retries => {
                    warn!("Connection test failed (attempt {}): {}", retries + 1, e);
                    retries += 1;
                }
                Err(e) => {
                    error!("Connection test failed permanently: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

async fn send_command(
    association: &mut ClientAssociation<TcpStream>,
    pc_id: u8,
    command: &InMemDicomObject<StandardDataDictionary>,
) -> Result<()> {
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(&mut data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::dicom_object(e.to_string()))?;
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    };
    association
        .send(&pdu)
        .await
        .map_err(|e| DimseError::dicom_ul(e.to_string()))
}

async fn receive_command(
    association: &mut ClientAssociation<TcpStream>,
) -> Result<InMemDicomObject<StandardDataDictionary>> {
    match association
        .receive()
        .await
        .map_err(|e| DimseError::dicom_ul(e.to_string()))?
    {
        Pdu::PData { data } => {
            let value = data
                .first()
                .ok_or_else(|| DimseError::dicom_ul("empty response PDU"))?;
            InMemDicomObject::read_dataset_with_ts(
                value.data.as_slice(),
                &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )
            .map_err(|e| DimseError::dicom_object(e.to_string()))
        }
        other => Err(DimseError::dicom_ul(format!(
            "unexpected PDU while awaiting response: {other:?}"
        ))),
    }
}

async fn release(association: &mut ClientAssociation<TcpStream>) {
    if let Err(e) = association.release().await {
        warn!(error = %e, "failed to release association cleanly");
    }
}

fn build_echo_request(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter(vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
    ])
}

fn build_store_request(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter(vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// Builder for creating SCU instances with custom configurations.
pub struct ScuBuilder {
    config: DimseConfig,
}

impl ScuBuilder {
    /// Start building a new SCU.
    pub fn new() -> Self {
        Self {
            config: DimseConfig::default(),
        }
    }

    /// Set the local AE title.
    pub fn local_aet(mut self, aet: impl Into<String>) -> Self {
        self.config.local_aet = aet.into();
        self
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum PDU size.
    pub fn max_pdu(mut self, size: u32) -> Self {
        self.config.max_pdu = size;
        self
    }

    /// Build the SCU.
    pub fn build(self) -> Result<DimseScu> {
        self.config.validate()?;
        Ok(DimseScu::new(self.config))
    }
}

impl Default for ScuBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scu_creation() {
        let scu = ScuBuilder::new()
            .local_aet("TEST_SCU")
            .connection_timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        assert_eq!(scu.config.local_aet, "TEST_SCU");
        assert_eq!(scu.config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_invalid_config_validation() {
        let result = ScuBuilder::new().local_aet("").build();
        assert!(result.is_err());
    }

    #[test]
    fn echo_request_carries_verification_sop_class() {
        let req = build_echo_request(7);
        assert_eq!(
            req.element(tags::COMMAND_FIELD)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            C_ECHO_RQ
        );
        assert_eq!(
            req.element(tags::MESSAGE_ID).unwrap().to_int::<u16>().unwrap(),
            7
        );
    }

    #[test]
    fn store_request_carries_sop_identifiers() {
        let req = build_store_request(uids::CT_IMAGE_STORAGE, "1.2.3.4", 3);
        assert_eq!(
            req.element(tags::AFFECTED_SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap(),
            "1.2.3.4"
        );
        assert_eq!(
            req.element(tags::COMMAND_FIELD)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            C_STORE_RQ
        );
    }
}
