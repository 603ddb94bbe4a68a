//! Bridges the synchronous, redb-backed `MappingRepo` (§storage) to the
//! async `PatientMappingStore` trait the `phi` crate's anonymizer and
//! resolver depend on.
//!
//! `MappingRepo`'s calls are blocking (redb transactions, no await points),
//! so each trait method hands the work to `spawn_blocking` rather than
//! calling it inline. Unlike `block_in_place`, `spawn_blocking` is sound on
//! every runtime flavor, including the `current_thread` runtime
//! `#[tokio::test]` uses by default.

use std::collections::HashMap;

use async_trait::async_trait;
use phi::error::{PhiError, Result as PhiResult};
use phi::mapping::{MappingView, PatientMappingStore};

use crate::models::PatientMapping;
use crate::storage::MappingRepo;

/// `PatientMappingStore` implementation backed by the proxy's own
/// `MappingRepo`/redb tables.
pub struct RedbPatientMappingStore {
    repo: MappingRepo,
}

impl RedbPatientMappingStore {
    pub fn new(repo: MappingRepo) -> Self {
        Self { repo }
    }
}

fn to_view(mapping: PatientMapping) -> MappingView {
    MappingView {
        original_patient_name: mapping.original_name,
        original_patient_id: mapping.original_id,
        anonymous_patient_name: mapping.anonymous_name,
        anonymous_patient_id: mapping.anonymous_id,
        patient_level_phi: mapping.patient_level_phi,
    }
}

/// Run a blocking closure on the blocking thread pool, mapping a join
/// failure (panic inside the closure) to a store error.
async fn spawn_blocking_store<F, T>(f: F) -> PhiResult<T>
where
    F: FnOnce() -> PhiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PhiError::store(format!("mapping store task panicked: {e}")))?
}

#[async_trait]
impl PatientMappingStore for RedbPatientMappingStore {
    async fn get_or_create(
        &self,
        original_name: &str,
        original_id: &str,
    ) -> PhiResult<(MappingView, bool)> {
        let repo = self.repo.clone();
        let original_name = original_name.to_string();
        let original_id = original_id.to_string();

        spawn_blocking_store(move || {
            let existed = repo
                .find_by_original_id(&original_id)
                .map_err(|e| PhiError::store(e.to_string()))?
                .is_some();
            let mapping = repo
                .get_or_create(&original_name, &original_id)
                .map_err(|e| PhiError::store(e.to_string()))?;
            Ok((to_view(mapping), existed))
        })
        .await
    }

    async fn find_by_anonymous(
        &self,
        _anonymous_name: Option<&str>,
        anonymous_id: Option<&str>,
    ) -> PhiResult<Option<MappingView>> {
        let anonymous_id = match anonymous_id {
            Some(id) => id.to_string(),
            None => return Ok(None),
        };
        let repo = self.repo.clone();

        spawn_blocking_store(move || {
            let mapping = repo
                .find_by_anonymous_id(&anonymous_id)
                .map_err(|e| PhiError::store(e.to_string()))?;
            Ok(mapping.map(to_view))
        })
        .await
    }

    async fn find_by_original(
        &self,
        _original_name: Option<&str>,
        original_id: Option<&str>,
    ) -> PhiResult<Option<MappingView>> {
        let original_id = match original_id {
            Some(id) => id.to_string(),
            None => return Ok(None),
        };
        let repo = self.repo.clone();

        spawn_blocking_store(move || {
            let mapping = repo
                .find_by_original_id(&original_id)
                .map_err(|e| PhiError::store(e.to_string()))?;
            Ok(mapping.map(to_view))
        })
        .await
    }

    async fn merge_patient_phi(
        &self,
        original_patient_id: &str,
        phi: HashMap<String, String>,
    ) -> PhiResult<()> {
        let repo = self.repo.clone();
        let original_patient_id = original_patient_id.to_string();

        spawn_blocking_store(move || {
            let mut mapping = repo
                .find_by_original_id(&original_patient_id)
                .map_err(|e| PhiError::store(e.to_string()))?
                .ok_or_else(|| {
                    PhiError::store(format!("no mapping for patient {original_patient_id}"))
                })?;
            mapping.merge_phi(phi);
            repo.upsert(&mapping).map_err(|e| PhiError::store(e.to_string()))
        })
        .await
    }

    async fn all(&self) -> PhiResult<Vec<MappingView>> {
        let repo = self.repo.clone();

        spawn_blocking_store(move || {
            Ok(repo
                .all()
                .map_err(|e| PhiError::store(e.to_string()))?
                .into_iter()
                .map(to_view)
                .collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ProxyStore;
    use redb::Database;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample_store() -> (TempDir, RedbPatientMappingStore) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("phi.redb");
        let db = Database::create(&db_path).unwrap();
        let proxy_store = ProxyStore::with_shared_db(Arc::new(db), db_path).unwrap();
        let store = RedbPatientMappingStore::new(proxy_store.mappings());
        (temp_dir, store)
    }

    #[tokio::test]
    async fn get_or_create_reports_whether_it_already_existed() {
        let (_dir, store) = sample_store();

        let (first, existed_first) = store.get_or_create("Doe^John", "12345").await.unwrap();
        assert!(!existed_first);
        assert_eq!(first.anonymous_patient_id, "ANON-12345");

        let (second, existed_second) = store.get_or_create("Doe^John", "12345").await.unwrap();
        assert!(existed_second);
        assert_eq!(second.anonymous_patient_id, first.anonymous_patient_id);
    }

    #[tokio::test]
    async fn find_by_anonymous_and_original_round_trip() {
        let (_dir, store) = sample_store();
        store.get_or_create("Doe^John", "12345").await.unwrap();

        let by_anon = store
            .find_by_anonymous(None, Some("ANON-12345"))
            .await
            .unwrap();
        assert!(by_anon.is_some());

        let by_orig = store.find_by_original(None, Some("12345")).await.unwrap();
        assert!(by_orig.is_some());
    }

    #[tokio::test]
    async fn merge_patient_phi_updates_existing_mapping() {
        let (_dir, store) = sample_store();
        store.get_or_create("Doe^John", "12345").await.unwrap();

        store
            .merge_patient_phi(
                "12345",
                HashMap::from([("PatientSex".to_string(), "M".to_string())]),
            )
            .await
            .unwrap();

        let view = store
            .find_by_original(None, Some("12345"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.patient_level_phi.get("PatientSex").unwrap(), "M");
    }

    #[tokio::test]
    async fn all_returns_every_mapping() {
        let (_dir, store) = sample_store();
        store.get_or_create("Doe^John", "12345").await.unwrap();
        store.get_or_create("Smith^Jane", "67890").await.unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
