//! Scenario 4 (spec.md §8): a batch sent to an unreachable node retries up
//! to `node.retry_count` times before the dispatcher reports the whole
//! batch as failed.

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use pacsproxy::dispatch::ScuDispatcher;
use pacsproxy::models::{NodeConfig, Permission};

fn unreachable_node() -> NodeConfig {
    NodeConfig {
        node_id: "unreachable-1".to_string(),
        name: "unreachable".to_string(),
        ae_title: "REMOTE".to_string(),
        host: "127.0.0.1".to_string(),
        port: 1,
        is_active: true,
        is_reachable: true,
        permission: Permission::ReadWrite,
        connection_timeout_secs: 1,
        max_pdu_size: 16384,
        retry_count: 3,
        retry_delay_secs: 0,
    }
}

fn sample_object() -> InMemDicomObject<StandardDataDictionary> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2"),
    ));
    obj
}

#[tokio::test]
async fn unreachable_node_exhausts_configured_retries_before_failing() {
    let dispatcher = ScuDispatcher::new("PACSPROXY");
    let objects = vec![sample_object(), sample_object()];

    let result = dispatcher.send_to_node(&unreachable_node(), objects).await;

    assert_eq!(result.files_sent, 0);
    assert_eq!(result.files_failed, 2);
    assert!(result.error.is_some());
}
