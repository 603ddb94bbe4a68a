//! Scenario 1 (spec.md §8): a C-STORE of one instance round-trips through
//! the staging store with the exact UIDs and `PatientID` it arrived with,
//! producing a Session and Scan that reference it.

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use pacsproxy::storage::{ProxyStore, StagingStore, StoreRequest};
use redb::Database;
use std::sync::Arc;
use tempfile::TempDir;

fn wrapped_object(sop_class_uid: &str) -> InMemDicomObject<StandardDataDictionary> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)));
    obj
}

fn open_staging(temp_dir: &TempDir) -> StagingStore {
    let db_path = temp_dir.path().join("proxy.redb");
    let db = Database::create(&db_path).unwrap();
    let store = ProxyStore::with_shared_db(Arc::new(db), db_path).unwrap();
    StagingStore::new(temp_dir.path().join("instances"), store)
}

#[test]
fn stored_instance_round_trips_with_exact_ids() {
    let temp_dir = TempDir::new().unwrap();
    let staging = open_staging(&temp_dir);

    let request = StoreRequest {
        study_instance_uid: "1.2.840.113619.2.1.1".to_string(),
        series_instance_uid: "1.2.840.113619.2.1.1.1".to_string(),
        sop_instance_uid: "1.2.840.113619.2.1.1.1.1".to_string(),
        transfer_syntax_uid: "1.2.840.10008.1.2.1".to_string(),
        modality: "CT".to_string(),
        patient_id: "P42".to_string(),
        patient_name: "DOE^JOHN".to_string(),
        study_date: Some("20260101".to_string()),
        study_time: Some("120000".to_string()),
        study_description: Some("CHEST CT".to_string()),
        accession_number: Some("ACC001".to_string()),
        series_number: Some("1".to_string()),
        series_description: Some("AXIAL".to_string()),
        study_level_phi: Default::default(),
        series_level_phi: Default::default(),
        object: wrapped_object("1.2.840.10008.5.1.4.1.1.2"),
    };

    let result = staging.store_dicom_file(request).expect("store should succeed");

    assert_eq!(result.session.study_instance_uid, "1.2.840.113619.2.1.1");
    assert_eq!(result.session.patient_id, "P42");
    assert_eq!(result.scan.series_instance_uid, "1.2.840.113619.2.1.1.1");
    assert_eq!(result.scan.instances_count, 1);
    assert!(result.file_path.exists());
}
