//! redb-backed repositories for the proxy's domain entities.
//!
//! Follows the same shape as the JMIX package index: one shared `Database`
//! handle obtained through `DatabaseManager`, JSON-serialized rows, and a
//! plain `{find, upsert, delete}` surface per entity rather than an ORM.
//! Unlike the JMIX index, all four entities share one database file (one
//! table per lookup key) since they are mutated together under the staging
//! store's single writer mutex.

use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::{PatientMapping, Scan, Session, UploadLog};
use crate::storage::{DatabaseBackend, DatabaseManager, DatabaseOperation, StorageError, StorageResult};

const MAPPINGS_BY_ORIGINAL_ID: TableDefinition<&str, &str> =
    TableDefinition::new("mappings_by_original_id");
const MAPPINGS_BY_ANONYMOUS_ID: TableDefinition<&str, &str> =
    TableDefinition::new("mappings_by_anonymous_id");

const SESSIONS_BY_STUDY_UID: TableDefinition<&str, &str> =
    TableDefinition::new("sessions_by_study_uid");

const SCANS_BY_SERIES_UID: TableDefinition<&str, &str> = TableDefinition::new("scans_by_series_uid");
const SCANS_BY_STUDY_UID: TableDefinition<&str, &str> = TableDefinition::new("scans_by_study_uid");

const UPLOAD_LOGS_BY_STUDY_UID: TableDefinition<&str, &str> =
    TableDefinition::new("upload_logs_by_study_uid");

/// Shared handle to the proxy's embedded database, opened once per process
/// and handed out to the individual repositories.
#[derive(Clone)]
pub struct ProxyStore {
    db: Arc<Database>,
    db_path: PathBuf,
}

impl ProxyStore {
    pub fn open(db_path: &Path) -> StorageResult<Self> {
        let db = DatabaseManager::global()
            .get_or_create_database(db_path)
            .map_err(StorageError::Config)?;
        let store = Self {
            db,
            db_path: db_path.to_path_buf(),
        };
        store
            .initialize_tables(&store.db.clone())
            .map_err(StorageError::Config)?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn with_shared_db(db: Arc<Database>, db_path: PathBuf) -> StorageResult<Self> {
        let store = Self { db, db_path };
        store
            .initialize_tables(&store.db.clone())
            .map_err(StorageError::Config)?;
        Ok(store)
    }

    pub fn mappings(&self) -> MappingRepo {
        MappingRepo { db: self.db.clone() }
    }

    pub fn sessions(&self) -> SessionRepo {
        SessionRepo { db: self.db.clone() }
    }

    pub fn scans(&self) -> ScanRepo {
        ScanRepo { db: self.db.clone() }
    }

    pub fn upload_logs(&self) -> UploadLogRepo {
        UploadLogRepo { db: self.db.clone() }
    }
}

impl DatabaseBackend for ProxyStore {
    fn database_path(&self) -> PathBuf {
        self.db_path.clone()
    }

    fn initialize_tables(&self, db: &Database) -> Result<(), String> {
        DatabaseManager::global().initialize_tables(
            db,
            &[
                &MAPPINGS_BY_ORIGINAL_ID,
                &MAPPINGS_BY_ANONYMOUS_ID,
                &SESSIONS_BY_STUDY_UID,
                &SCANS_BY_SERIES_UID,
                &SCANS_BY_STUDY_UID,
                &UPLOAD_LOGS_BY_STUDY_UID,
            ],
        )
    }
}

/// PatientMapping repository, indexed both by the original and the
/// anonymized patient ID so lookups work from either direction (§4.3).
#[derive(Clone)]
pub struct MappingRepo {
    db: Arc<Database>,
}

impl MappingRepo {
    pub fn find_by_original_id(&self, original_id: &str) -> StorageResult<Option<PatientMapping>> {
        let key = original_id.to_string();
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn
                .open_table(MAPPINGS_BY_ORIGINAL_ID)
                .map_err(|e| e.to_string())?;
            match table.get(key.as_str()).map_err(|e| e.to_string())? {
                Some(value) => {
                    let mapping = serde_json::from_str(value.value()).map_err(|e| e.to_string())?;
                    Ok(Some(mapping))
                }
                None => Ok(None),
            }
        })
        .map_err(StorageError::Config)
    }

    pub fn find_by_anonymous_id(&self, anonymous_id: &str) -> StorageResult<Option<PatientMapping>> {
        let key = anonymous_id.to_string();
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn
                .open_table(MAPPINGS_BY_ANONYMOUS_ID)
                .map_err(|e| e.to_string())?;
            match table.get(key.as_str()).map_err(|e| e.to_string())? {
                Some(value) => {
                    let mapping = serde_json::from_str(value.value()).map_err(|e| e.to_string())?;
                    Ok(Some(mapping))
                }
                None => Ok(None),
            }
        })
        .map_err(StorageError::Config)
    }

    /// Atomically create-or-fetch the mapping for a patient. If another
    /// writer raced us and already created the row, returns the existing one
    /// (§4.3 step 3's unique-violation recovery).
    pub fn get_or_create(
        &self,
        original_name: &str,
        original_id: &str,
    ) -> StorageResult<PatientMapping> {
        let original_name = original_name.to_string();
        let original_id = original_id.to_string();

        DatabaseOperation::write(&self.db, |txn| {
            let existing = {
                let table = txn
                    .open_table(MAPPINGS_BY_ORIGINAL_ID)
                    .map_err(|e| e.to_string())?;
                match table.get(original_id.as_str()).map_err(|e| e.to_string())? {
                    Some(value) => {
                        let mapping: PatientMapping =
                            serde_json::from_str(value.value()).map_err(|e| e.to_string())?;
                        Some(mapping)
                    }
                    None => None,
                }
            };

            if let Some(mapping) = existing {
                return Ok(mapping);
            }

            let mapping = PatientMapping::new(original_name, original_id.clone());
            let json = serde_json::to_string(&mapping).map_err(|e| e.to_string())?;
            {
                let mut table = txn
                    .open_table(MAPPINGS_BY_ORIGINAL_ID)
                    .map_err(|e| e.to_string())?;
                table.insert(original_id.as_str(), json.as_str()).map_err(|e| e.to_string())?;
            }
            {
                let mut table = txn
                    .open_table(MAPPINGS_BY_ANONYMOUS_ID)
                    .map_err(|e| e.to_string())?;
                table
                    .insert(mapping.anonymous_id.as_str(), json.as_str())
                    .map_err(|e| e.to_string())?;
            }
            Ok(mapping)
        })
        .map_err(StorageError::Config)
    }

    pub fn upsert(&self, mapping: &PatientMapping) -> StorageResult<()> {
        let json = serde_json::to_string(mapping).map_err(|e| e.to_string())?;
        DatabaseOperation::write(&self.db, |txn| {
            {
                let mut table = txn
                    .open_table(MAPPINGS_BY_ORIGINAL_ID)
                    .map_err(|e| e.to_string())?;
                table
                    .insert(mapping.original_id.as_str(), json.as_str())
                    .map_err(|e| e.to_string())?;
            }
            {
                let mut table = txn
                    .open_table(MAPPINGS_BY_ANONYMOUS_ID)
                    .map_err(|e| e.to_string())?;
                table
                    .insert(mapping.anonymous_id.as_str(), json.as_str())
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        })
        .map_err(StorageError::Config)
    }

    /// Every mapping row, keyed by original ID. Used by the resolver to
    /// build a complete anonymous-to-original lookup.
    pub fn all(&self) -> StorageResult<Vec<PatientMapping>> {
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn
                .open_table(MAPPINGS_BY_ORIGINAL_ID)
                .map_err(|e| e.to_string())?;
            let mut mappings = Vec::new();
            for entry in table.iter().map_err(|e| e.to_string())? {
                let (_, value) = entry.map_err(|e| e.to_string())?;
                let mapping: PatientMapping =
                    serde_json::from_str(value.value()).map_err(|e| e.to_string())?;
                mappings.push(mapping);
            }
            Ok(mappings)
        })
        .map_err(StorageError::Config)
    }

    pub fn delete_by_original_id(&self, original_id: &str) -> StorageResult<bool> {
        let mapping = match self.find_by_original_id(original_id)? {
            Some(m) => m,
            None => return Ok(false),
        };
        DatabaseOperation::write(&self.db, |txn| {
            {
                let mut table = txn
                    .open_table(MAPPINGS_BY_ORIGINAL_ID)
                    .map_err(|e| e.to_string())?;
                table.remove(mapping.original_id.as_str()).map_err(|e| e.to_string())?;
            }
            {
                let mut table = txn
                    .open_table(MAPPINGS_BY_ANONYMOUS_ID)
                    .map_err(|e| e.to_string())?;
                table
                    .remove(mapping.anonymous_id.as_str())
                    .map_err(|e| e.to_string())?;
            }
            Ok(true)
        })
        .map_err(StorageError::Config)
    }
}

/// Session (Study) repository, keyed by studyInstanceUID.
pub struct SessionRepo {
    db: Arc<Database>,
}

impl SessionRepo {
    pub fn find_by_study_uid(&self, study_uid: &str) -> StorageResult<Option<Session>> {
        let key = study_uid.to_string();
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn
                .open_table(SESSIONS_BY_STUDY_UID)
                .map_err(|e| e.to_string())?;
            match table.get(key.as_str()).map_err(|e| e.to_string())? {
                Some(value) => {
                    let session = serde_json::from_str(value.value()).map_err(|e| e.to_string())?;
                    Ok(Some(session))
                }
                None => Ok(None),
            }
        })
        .map_err(StorageError::Config)
    }

    pub fn upsert(&self, session: &Session) -> StorageResult<()> {
        let json = serde_json::to_string(session).map_err(|e| e.to_string())?;
        DatabaseOperation::write(&self.db, |txn| {
            let mut table = txn
                .open_table(SESSIONS_BY_STUDY_UID)
                .map_err(|e| e.to_string())?;
            table
                .insert(session.study_instance_uid.as_str(), json.as_str())
                .map_err(|e| e.to_string())?;
            Ok(())
        })
        .map_err(StorageError::Config)
    }

    pub fn delete(&self, study_uid: &str) -> StorageResult<bool> {
        DatabaseOperation::write(&self.db, |txn| {
            let mut table = txn
                .open_table(SESSIONS_BY_STUDY_UID)
                .map_err(|e| e.to_string())?;
            Ok(table.remove(study_uid).map_err(|e| e.to_string())?.is_some())
        })
        .map_err(StorageError::Config)
    }

    /// All sessions belonging to a patient, matched by anonymized patient ID
    /// (the only identifier a Session ever stores, per I2).
    pub fn find_by_anonymous_patient_id(&self, anonymous_id: &str) -> StorageResult<Vec<Session>> {
        let anonymous_id = anonymous_id.to_string();
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn
                .open_table(SESSIONS_BY_STUDY_UID)
                .map_err(|e| e.to_string())?;
            let mut matches = Vec::new();
            for entry in table.iter().map_err(|e| e.to_string())? {
                let (_, value) = entry.map_err(|e| e.to_string())?;
                let session: Session =
                    serde_json::from_str(value.value()).map_err(|e| e.to_string())?;
                if session.patient_id == anonymous_id {
                    matches.push(session);
                }
            }
            Ok(matches)
        })
        .map_err(StorageError::Config)
    }
}

/// Scan (Series) repository, keyed by seriesInstanceUID with a secondary
/// index by parent studyInstanceUID.
pub struct ScanRepo {
    db: Arc<Database>,
}

impl ScanRepo {
    pub fn find_by_series_uid(&self, series_uid: &str) -> StorageResult<Option<Scan>> {
        let key = series_uid.to_string();
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn.open_table(SCANS_BY_SERIES_UID).map_err(|e| e.to_string())?;
            match table.get(key.as_str()).map_err(|e| e.to_string())? {
                Some(value) => {
                    let scan = serde_json::from_str(value.value()).map_err(|e| e.to_string())?;
                    Ok(Some(scan))
                }
                None => Ok(None),
            }
        })
        .map_err(StorageError::Config)
    }

    pub fn find_by_study_uid(&self, study_uid: &str) -> StorageResult<Vec<Scan>> {
        let prefix = format!("{study_uid}:");
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn.open_table(SCANS_BY_STUDY_UID).map_err(|e| e.to_string())?;
            let mut matches = Vec::new();
            for entry in table.iter().map_err(|e| e.to_string())? {
                let (key, value) = entry.map_err(|e| e.to_string())?;
                if key.value().starts_with(&prefix) {
                    let scan: Scan =
                        serde_json::from_str(value.value()).map_err(|e| e.to_string())?;
                    matches.push(scan);
                }
            }
            Ok(matches)
        })
        .map_err(StorageError::Config)
    }

    pub fn upsert(&self, scan: &Scan) -> StorageResult<()> {
        let json = serde_json::to_string(scan).map_err(|e| e.to_string())?;
        let composite_key = format!("{}:{}", scan.study_instance_uid, scan.series_instance_uid);
        DatabaseOperation::write(&self.db, |txn| {
            {
                let mut table = txn.open_table(SCANS_BY_SERIES_UID).map_err(|e| e.to_string())?;
                table
                    .insert(scan.series_instance_uid.as_str(), json.as_str())
                    .map_err(|e| e.to_string())?;
            }
            {
                let mut table = txn.open_table(SCANS_BY_STUDY_UID).map_err(|e| e.to_string())?;
                table
                    .insert(composite_key.as_str(), json.as_str())
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        })
        .map_err(StorageError::Config)
    }

    pub fn delete(&self, series_uid: &str) -> StorageResult<bool> {
        let scan = match self.find_by_series_uid(series_uid)? {
            Some(s) => s,
            None => return Ok(false),
        };
        DatabaseOperation::write(&self.db, |txn| {
            {
                let mut table = txn.open_table(SCANS_BY_SERIES_UID).map_err(|e| e.to_string())?;
                table.remove(scan.series_instance_uid.as_str()).map_err(|e| e.to_string())?;
            }
            {
                let mut table = txn.open_table(SCANS_BY_STUDY_UID).map_err(|e| e.to_string())?;
                let composite_key =
                    format!("{}:{}", scan.study_instance_uid, scan.series_instance_uid);
                table.remove(composite_key.as_str()).map_err(|e| e.to_string())?;
            }
            Ok(true)
        })
        .map_err(StorageError::Config)
    }

    /// Delete every Scan owned by a study, used when a Session is deleted.
    pub fn delete_by_study_uid(&self, study_uid: &str) -> StorageResult<usize> {
        let scans = self.find_by_study_uid(study_uid)?;
        let mut removed = 0;
        for scan in &scans {
            if self.delete(&scan.series_instance_uid)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// UploadLog repository. Append-only per Session: keyed by
/// `"<studyUid>:<attemptNumber>"` so every retry gets its own row.
pub struct UploadLogRepo {
    db: Arc<Database>,
}

impl UploadLogRepo {
    pub fn append(&self, log: &UploadLog) -> StorageResult<()> {
        let key = format!("{}:{}", log.study_instance_uid, log.attempt_number);
        let json = serde_json::to_string(log).map_err(|e| e.to_string())?;
        DatabaseOperation::write(&self.db, |txn| {
            let mut table = txn
                .open_table(UPLOAD_LOGS_BY_STUDY_UID)
                .map_err(|e| e.to_string())?;
            table.insert(key.as_str(), json.as_str()).map_err(|e| e.to_string())?;
            Ok(())
        })
        .map_err(StorageError::Config)
    }

    pub fn find_by_study_uid(&self, study_uid: &str) -> StorageResult<Vec<UploadLog>> {
        let prefix = format!("{study_uid}:");
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn
                .open_table(UPLOAD_LOGS_BY_STUDY_UID)
                .map_err(|e| e.to_string())?;
            let mut matches = Vec::new();
            for entry in table.iter().map_err(|e| e.to_string())? {
                let (key, value) = entry.map_err(|e| e.to_string())?;
                if key.value().starts_with(&prefix) {
                    let log: UploadLog =
                        serde_json::from_str(value.value()).map_err(|e| e.to_string())?;
                    matches.push(log);
                }
            }
            matches.sort_by_key(|l| l.attempt_number);
            Ok(matches)
        })
        .map_err(StorageError::Config)
    }

    /// I4: at least one successful attempt with a non-null API response ID.
    pub fn has_successful_upload(&self, study_uid: &str) -> StorageResult<bool> {
        Ok(self
            .find_by_study_uid(study_uid)?
            .iter()
            .any(|l| l.status == crate::models::UploadStatus::Success && l.api_response_id.is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::Database;
    use tempfile::TempDir;

    fn open_test_store() -> (TempDir, ProxyStore) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let db = Database::create(&db_path).unwrap();
        let store = ProxyStore::with_shared_db(Arc::new(db), db_path).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn get_or_create_mapping_is_idempotent() {
        let (_dir, store) = open_test_store();
        let repo = store.mappings();

        let first = repo.get_or_create("Doe^John", "12345").unwrap();
        let second = repo.get_or_create("Doe^John", "12345").unwrap();

        assert_eq!(first.anonymous_id, second.anonymous_id);
        assert_eq!(first.anonymous_id, "ANON-12345");
    }

    #[test]
    fn all_mappings_lists_every_row() {
        let (_dir, store) = open_test_store();
        let repo = store.mappings();
        repo.get_or_create("Doe^John", "12345").unwrap();
        repo.get_or_create("Smith^Jane", "67890").unwrap();

        let all = repo.all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn mapping_lookup_works_from_either_id() {
        let (_dir, store) = open_test_store();
        let repo = store.mappings();
        repo.get_or_create("Doe^John", "12345").unwrap();

        assert!(repo.find_by_original_id("12345").unwrap().is_some());
        assert!(repo.find_by_anonymous_id("ANON-12345").unwrap().is_some());
    }

    #[test]
    fn session_upsert_and_find_roundtrip() {
        let (_dir, store) = open_test_store();
        let repo = store.sessions();
        let session = Session::new("1.2.3", "/tmp/1.2.3");
        repo.upsert(&session).unwrap();

        let found = repo.find_by_study_uid("1.2.3").unwrap().unwrap();
        assert_eq!(found.study_instance_uid, "1.2.3");
    }

    #[test]
    fn scan_delete_by_study_uid_removes_all_series() {
        let (_dir, store) = open_test_store();
        let repo = store.scans();
        repo.upsert(&Scan::new("1.2.3.1", "1.2.3", "CT", "/tmp/s1")).unwrap();
        repo.upsert(&Scan::new("1.2.3.2", "1.2.3", "CT", "/tmp/s2")).unwrap();

        let removed = repo.delete_by_study_uid("1.2.3").unwrap();
        assert_eq!(removed, 2);
        assert!(repo.find_by_study_uid("1.2.3").unwrap().is_empty());
    }

    #[test]
    fn upload_log_append_is_additive_per_attempt() {
        let (_dir, store) = open_test_store();
        let repo = store.upload_logs();
        let mut log1 = UploadLog::start_attempt("1.2.3", 1);
        log1.mark_failed("timeout", "ETIMEDOUT");
        repo.append(&log1).unwrap();

        let mut log2 = UploadLog::start_attempt("1.2.3", 2);
        log2.mark_success("resp-1", 1024);
        repo.append(&log2).unwrap();

        let logs = repo.find_by_study_uid("1.2.3").unwrap();
        assert_eq!(logs.len(), 2);
        assert!(repo.has_successful_upload("1.2.3").unwrap());
    }
}
