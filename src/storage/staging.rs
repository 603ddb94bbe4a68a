//! Staging store (§4.4): writes inbound instances to disk under
//! `<storageRoot>/<patientId>/<studyUid>/<seriesUid>/<sopInstanceUid>.dcm`,
//! maintains the series' `instances.xml` index, and upserts the owning
//! Session and Scan rows.
//!
//! `store_dicom_file` is serialized by a single mutex, mirroring the
//! contract's "serialized by a single mutex per process" requirement: all
//! writers share one lock so the directory tree, instance index and the
//! Session/Scan rows never observe a partial update from a concurrent
//! C-STORE. Different studies only contend briefly since the filesystem and
//! database writes dominate the critical section, not the lock itself.

use dicom_object::{InMemDicomObject, StandardDataDictionary};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::models::{InstanceRecord, PhiMap, Scan, Session};
use crate::storage::{
    instance_path, series_dir, InstanceIndex, ProxyStore, StorageError, StorageResult,
};

/// Everything the staging store needs to persist one inbound instance. The
/// dataset has already been through access control and, if configured,
/// anonymization (§4.2/§4.3) by the time it reaches here.
pub struct StoreRequest {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax_uid: String,
    pub modality: String,
    /// Anonymized or pass-through patient ID, used only to bucket the
    /// on-disk tree; never the original PHI value (I2).
    pub patient_id: String,
    pub patient_name: String,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    pub series_number: Option<String>,
    pub series_description: Option<String>,
    pub study_level_phi: PhiMap,
    pub series_level_phi: PhiMap,
    /// Fully built file-meta-bearing object ready for `write_to_file`.
    pub object: InMemDicomObject<StandardDataDictionary>,
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub session: Session,
    pub scan: Scan,
    pub file_path: PathBuf,
}

pub struct StagingStore {
    storage_root: PathBuf,
    store: ProxyStore,
    write_lock: Mutex<()>,
}

impl StagingStore {
    pub fn new(storage_root: PathBuf, store: ProxyStore) -> Self {
        Self {
            storage_root,
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Write one instance to disk and upsert its owning Session/Scan rows.
    ///
    /// Synchronous and mutex-serialized: the store handler calls this from a
    /// `spawn_blocking` task (or a dedicated writer task) so the async DIMSE
    /// handler never blocks on it directly.
    pub fn store_dicom_file(&self, request: StoreRequest) -> StorageResult<StageResult> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let series_dir = series_dir(
            &self.storage_root,
            &request.patient_id,
            &request.study_instance_uid,
            &request.series_instance_uid,
        );
        std::fs::create_dir_all(&series_dir).map_err(StorageError::Io)?;

        let file_path = instance_path(&series_dir, &request.sop_instance_uid);
        request
            .object
            .write_to_file(&file_path)
            .map_err(|e| StorageError::Config(format!("failed to write DICOM file: {e}")))?;

        let file_size = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);

        let index = InstanceIndex::new(&series_dir);
        let instances = index
            .upsert(InstanceRecord {
                sop_instance_uid: request.sop_instance_uid.clone(),
                instance_number: None,
                file_name: file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                file_size,
                transfer_syntax_uid: request.transfer_syntax_uid.clone(),
                received_at: chrono::Utc::now(),
            })
            .map_err(StorageError::Io)?;

        let sessions = self.store.sessions();
        let mut session = sessions
            .find_by_study_uid(&request.study_instance_uid)?
            .unwrap_or_else(|| {
                Session::new(
                    request.study_instance_uid.clone(),
                    series_dir
                        .parent()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                )
            });
        session.patient_id = request.patient_id.clone();
        session.patient_name = request.patient_name.clone();
        if request.study_date.is_some() {
            session.study_date = request.study_date.clone();
        }
        if request.study_time.is_some() {
            session.study_time = request.study_time.clone();
        }
        if request.study_description.is_some() {
            session.study_description = request.study_description.clone();
        }
        if request.accession_number.is_some() {
            session.accession_number = request.accession_number.clone();
        }
        for (key, value) in request.study_level_phi {
            session.study_level_phi.insert(key, value);
        }
        session.touch();
        sessions.upsert(&session)?;

        let scans = self.store.scans();
        let mut scan = scans
            .find_by_series_uid(&request.series_instance_uid)?
            .unwrap_or_else(|| {
                Scan::new(
                    request.series_instance_uid.clone(),
                    request.study_instance_uid.clone(),
                    request.modality.clone(),
                    series_dir.to_string_lossy().into_owned(),
                )
            });
        if request.series_number.is_some() {
            scan.series_number = request.series_number.clone();
        }
        if request.series_description.is_some() {
            scan.series_description = request.series_description.clone();
        }
        for (key, value) in request.series_level_phi {
            scan.series_level_phi.insert(key, value);
        }
        // I1: instances_count tracks the series index, not a running counter,
        // so overwriting an existing SOP Instance UID never double-counts.
        scan.instances_count = instances.len() as u32;
        scans.upsert(&scan)?;

        Ok(StageResult {
            session,
            scan,
            file_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;
    use redb::Database;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample_object() -> InMemDicomObject<StandardDataDictionary> {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2"),
        ));
        obj
    }

    fn sample_store(storage_root: &std::path::Path) -> StagingStore {
        let db_path = storage_root.join("proxy.redb");
        let db = Database::create(&db_path).unwrap();
        let store = ProxyStore::with_shared_db(Arc::new(db), db_path).unwrap();
        StagingStore::new(storage_root.to_path_buf(), store)
    }

    #[test]
    fn store_dicom_file_creates_session_and_scan() {
        let temp_dir = TempDir::new().unwrap();
        let staging = sample_store(temp_dir.path());

        let request = StoreRequest {
            study_instance_uid: "1.2.3".to_string(),
            series_instance_uid: "1.2.3.1".to_string(),
            sop_instance_uid: "1.2.3.1.1".to_string(),
            transfer_syntax_uid: "1.2.840.10008.1.2.1".to_string(),
            modality: "CT".to_string(),
            patient_id: "ANON-1".to_string(),
            patient_name: "ANON-1".to_string(),
            study_date: Some("20260101".to_string()),
            study_time: None,
            study_description: None,
            accession_number: None,
            series_number: Some("1".to_string()),
            series_description: None,
            study_level_phi: PhiMap::new(),
            series_level_phi: PhiMap::new(),
            object: sample_object(),
        };

        let result = staging.store_dicom_file(request).unwrap();
        assert_eq!(result.scan.instances_count, 1);
        assert_eq!(result.session.study_instance_uid, "1.2.3");
        assert!(result.file_path.exists());
    }

    #[test]
    fn duplicate_sop_instance_uid_does_not_increment_count() {
        let temp_dir = TempDir::new().unwrap();
        let staging = sample_store(temp_dir.path());

        let make_request = || StoreRequest {
            study_instance_uid: "1.2.3".to_string(),
            series_instance_uid: "1.2.3.1".to_string(),
            sop_instance_uid: "1.2.3.1.1".to_string(),
            transfer_syntax_uid: "1.2.840.10008.1.2.1".to_string(),
            modality: "CT".to_string(),
            patient_id: "ANON-1".to_string(),
            patient_name: "ANON-1".to_string(),
            study_date: None,
            study_time: None,
            study_description: None,
            accession_number: None,
            series_number: None,
            series_description: None,
            study_level_phi: PhiMap::new(),
            series_level_phi: PhiMap::new(),
            object: sample_object(),
        };

        staging.store_dicom_file(make_request()).unwrap();
        let second = staging.store_dicom_file(make_request()).unwrap();
        assert_eq!(second.scan.instances_count, 1);
    }
}
