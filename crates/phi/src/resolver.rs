//! Restores original patient data into a previously anonymized dataset for
//! authorized outbound paths (dispatch, C-FIND/C-MOVE responses).

use std::collections::HashMap;
use std::sync::Arc;

use dicom_core::{DataElement, PrimitiveValue, Tag};
use dicom_object::InMemDicomObject;

use crate::error::Result;
use crate::mapping::{MappingView, PatientMappingStore};
use crate::tags::IDENTIFIER_TAGS;

pub struct PhiResolver {
    store: Arc<dyn PatientMappingStore>,
}

impl PhiResolver {
    pub fn new(store: Arc<dyn PatientMappingStore>) -> Self {
        Self { store }
    }

    /// Resolve anonymous patient identifiers to the original mapping. If
    /// `anonymous_name` contains `^` and no mapping is found on the first
    /// try, retries once with trailing `^` stripped.
    pub async fn resolve_patient(
        &self,
        anonymous_name: Option<&str>,
        anonymous_id: Option<&str>,
    ) -> Result<Option<MappingView>> {
        if let Some(found) = self
            .store
            .find_by_anonymous(anonymous_name, anonymous_id)
            .await?
        {
            return Ok(Some(found));
        }

        if let Some(name) = anonymous_name {
            if name.contains('^') {
                let cleaned = name.trim_end_matches('^');
                if let Some(found) = self
                    .store
                    .find_by_anonymous(Some(cleaned), Some(cleaned))
                    .await?
                {
                    tracing::info!(original = %name, cleaned, "resolved using cleaned name");
                    return Ok(Some(found));
                }
            }
        }

        Ok(None)
    }

    /// De-anonymize a dataset in place, restoring patient identifiers and
    /// patient-level PHI from the mapping store, plus whatever study-level
    /// and series-level PHI the caller already looked up from the owning
    /// Session/Scan rows.
    pub async fn resolve_dataset(
        &self,
        obj: &mut InMemDicomObject,
        study_phi: Option<&HashMap<String, String>>,
        series_phi: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        let anonymous_name = string_value(obj, IDENTIFIER_TAGS[0]);
        let anonymous_id = string_value(obj, IDENTIFIER_TAGS[1]);

        if anonymous_name.is_none() && anonymous_id.is_none() {
            return Ok(());
        }

        let Some(mapping) = self
            .resolve_patient(anonymous_name.as_deref(), anonymous_id.as_deref())
            .await?
        else {
            return Ok(());
        };

        set_str(obj, IDENTIFIER_TAGS[0], &mapping.original_patient_name);
        set_str(obj, IDENTIFIER_TAGS[1], &mapping.original_patient_id);

        restore_metadata(obj, &mapping.patient_level_phi);
        if let Some(phi) = study_phi {
            restore_metadata(obj, phi);
        }
        if let Some(phi) = series_phi {
            restore_metadata(obj, phi);
        }

        Ok(())
    }

    pub async fn get_all_mappings(&self) -> Result<Vec<MappingView>> {
        self.store.all().await
    }

    /// Inverts the mapping for C-FIND filter rewriting: given the original
    /// patient name/ID, returns the corresponding anonymous identifier.
    pub async fn resolve_to_anonymous(
        &self,
        original_name: Option<&str>,
        original_id: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(mapping) = self.store.find_by_original(original_name, original_id).await? else {
            return Ok(None);
        };
        if original_name.is_some() {
            Ok(Some(mapping.anonymous_patient_name))
        } else if original_id.is_some() {
            Ok(Some(mapping.anonymous_patient_id))
        } else {
            Ok(None)
        }
    }
}

fn restore_metadata(obj: &mut InMemDicomObject, phi: &HashMap<String, String>) {
    for (keyword, value) in phi {
        if keyword == "PatientName" || keyword == "PatientID" {
            continue;
        }
        if let Err(err) = set_by_keyword(obj, keyword, value) {
            tracing::warn!(tag = %keyword, error = %err, "could not restore PHI tag");
        }
    }
}

fn set_by_keyword(obj: &mut InMemDicomObject, keyword: &str, value: &str) -> Result<()> {
    use dicom_core::dictionary::DataDictionary;
    use dicom_dictionary_std::StandardDataDictionary;

    let Some(entry) = StandardDataDictionary.by_name(keyword) else {
        return Err(crate::error::PhiError::dicom_object(format!(
            "unknown tag keyword: {keyword}"
        )));
    };
    let tag = entry.tag.inner();

    let vr = obj
        .element(tag)
        .ok()
        .map(|e| e.header().vr())
        .unwrap_or(entry.vr);

    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    Ok(())
}

fn set_str(obj: &mut InMemDicomObject, tag: Tag, value: &str) {
    let vr = obj
        .element(tag)
        .ok()
        .map(|e| e.header().vr())
        .unwrap_or(dicom_core::VR::LO);
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

fn string_value(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingView;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryStore {
        rows: StdMutex<Vec<MappingView>>,
    }

    #[async_trait]
    impl PatientMappingStore for MemoryStore {
        async fn get_or_create(
            &self,
            original_name: &str,
            original_id: &str,
        ) -> Result<(MappingView, bool)> {
            let anon = MappingView::deterministic_anonymous_id(original_id);
            let view = MappingView {
                original_patient_name: original_name.to_string(),
                original_patient_id: original_id.to_string(),
                anonymous_patient_name: anon.clone(),
                anonymous_patient_id: anon,
                patient_level_phi: HashMap::new(),
            };
            self.rows.lock().unwrap().push(view.clone());
            Ok((view, true))
        }

        async fn find_by_anonymous(
            &self,
            anonymous_name: Option<&str>,
            anonymous_id: Option<&str>,
        ) -> Result<Option<MappingView>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .find(|m| {
                    anonymous_name.is_some_and(|n| m.anonymous_patient_name == n)
                        || anonymous_id.is_some_and(|i| m.anonymous_patient_id == i)
                })
                .cloned())
        }

        async fn find_by_original(
            &self,
            original_name: Option<&str>,
            original_id: Option<&str>,
        ) -> Result<Option<MappingView>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .find(|m| {
                    original_name.is_some_and(|n| m.original_patient_name == n)
                        && original_id.is_some_and(|i| m.original_patient_id == i)
                })
                .cloned())
        }

        async fn merge_patient_phi(
            &self,
            _original_patient_id: &str,
            _phi: HashMap<String, String>,
        ) -> Result<()> {
            Ok(())
        }

        async fn all(&self) -> Result<Vec<MappingView>> {
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn resolve_strips_trailing_caret() {
        let store = Arc::new(MemoryStore::default());
        store.get_or_create("DOE^JOHN", "PID1").await.unwrap();
        let resolver = PhiResolver::new(store);
        let found = resolver
            .resolve_patient(Some("ANON-PID1^"), None)
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().original_patient_id, "PID1");
    }

    #[tokio::test]
    async fn resolve_to_anonymous_inverts_mapping() {
        let store = Arc::new(MemoryStore::default());
        store.get_or_create("DOE^JOHN", "PID1").await.unwrap();
        let resolver = PhiResolver::new(store);
        let anon = resolver
            .resolve_to_anonymous(None, Some("PID1"))
            .await
            .unwrap();
        assert_eq!(anon.as_deref(), Some("ANON-PID1"));
    }
}
