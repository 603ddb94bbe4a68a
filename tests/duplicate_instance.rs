//! Scenario 2 (spec.md §8): storing the same SOP Instance UID twice must not
//! double-count it in the owning Scan (I1: `instances_count` tracks the
//! series index length, not an incrementing counter).

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use pacsproxy::storage::{ProxyStore, StagingStore, StoreRequest};
use redb::Database;
use std::sync::Arc;
use tempfile::TempDir;

fn wrapped_object() -> InMemDicomObject<StandardDataDictionary> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2"),
    ));
    obj
}

fn request(sop_instance_uid: &str) -> StoreRequest {
    StoreRequest {
        study_instance_uid: "1.2.840.113619.2.55".to_string(),
        series_instance_uid: "1.2.840.113619.2.55.1".to_string(),
        sop_instance_uid: sop_instance_uid.to_string(),
        transfer_syntax_uid: "1.2.840.10008.1.2.1".to_string(),
        modality: "MR".to_string(),
        patient_id: "P99".to_string(),
        patient_name: "ROE^JANE".to_string(),
        study_date: None,
        study_time: None,
        study_description: None,
        accession_number: None,
        series_number: Some("1".to_string()),
        series_description: None,
        study_level_phi: Default::default(),
        series_level_phi: Default::default(),
        object: wrapped_object(),
    }
}

#[test]
fn resending_the_same_instance_keeps_the_count_at_one() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::create(temp_dir.path().join("proxy.redb")).unwrap();
    let store = ProxyStore::with_shared_db(Arc::new(db), temp_dir.path().join("proxy.redb")).unwrap();
    let staging = StagingStore::new(temp_dir.path().join("instances"), store);

    let first = staging.store_dicom_file(request("1.2.840.113619.2.55.1.1")).unwrap();
    assert_eq!(first.scan.instances_count, 1);

    let second = staging.store_dicom_file(request("1.2.840.113619.2.55.1.1")).unwrap();
    assert_eq!(second.scan.instances_count, 1);
    assert_eq!(first.file_path, second.file_path);
}

#[test]
fn a_genuinely_new_instance_in_the_same_series_increments_the_count() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::create(temp_dir.path().join("proxy.redb")).unwrap();
    let store = ProxyStore::with_shared_db(Arc::new(db), temp_dir.path().join("proxy.redb")).unwrap();
    let staging = StagingStore::new(temp_dir.path().join("instances"), store);

    staging.store_dicom_file(request("1.2.840.113619.2.55.1.1")).unwrap();
    let second = staging.store_dicom_file(request("1.2.840.113619.2.55.1.2")).unwrap();
    assert_eq!(second.scan.instances_count, 2);
}
