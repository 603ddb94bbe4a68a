//! De-identifies a DICOM dataset in place, extracting PHI into three level
//! maps the caller persists against PatientMapping/Session/Scan.

use std::collections::HashMap;
use std::sync::Arc;

use dicom_core::dictionary::DataDictionary;
use dicom_core::{DataElement, PrimitiveValue, Tag};
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;

use crate::error::Result;
use crate::mapping::{MappingView, PatientMappingStore};
use crate::tags::{self, DATE_TAGS, IDENTIFIER_TAGS, REMOVE_TAGS, TIME_TAGS};

const UNKNOWN_PATIENT: &str = "UNKNOWN";
const ANON_DATE: &str = "19700101";
const ANON_TIME: &str = "000000";

/// Result of anonymizing one dataset: the mapping used plus the three PHI
/// level maps extracted before rewriting, ready for the caller to persist
/// against PatientMapping/Session/Scan respectively.
#[derive(Debug, Clone)]
pub struct AnonymizationOutcome {
    pub mapping: MappingView,
    pub patient_phi: HashMap<String, String>,
    pub study_phi: HashMap<String, String>,
    pub series_phi: HashMap<String, String>,
}

pub struct Anonymizer {
    store: Arc<dyn PatientMappingStore>,
}

impl Anonymizer {
    pub fn new(store: Arc<dyn PatientMappingStore>) -> Self {
        Self { store }
    }

    /// Anonymize `obj` in place. Returns the mapping used and the extracted
    /// PHI levels so the caller can persist study/series PHI elsewhere.
    pub async fn anonymize_dataset(
        &self,
        obj: &mut InMemDicomObject,
    ) -> Result<AnonymizationOutcome> {
        let patient_name = string_value(obj, tags::IDENTIFIER_TAGS[0])
            .unwrap_or_else(|| UNKNOWN_PATIENT.to_string());
        let patient_id = string_value(obj, tags::IDENTIFIER_TAGS[1])
            .unwrap_or_else(|| UNKNOWN_PATIENT.to_string());

        let patient_phi = extract_level(obj, tags::PATIENT_LEVEL_TAGS);
        let study_phi = extract_level(obj, tags::STUDY_LEVEL_TAGS);
        let series_phi = extract_level(obj, tags::SERIES_LEVEL_TAGS);

        let mapping = self.anonymize_patient(&patient_name, &patient_id).await?;

        if !patient_phi.is_empty() {
            self.store
                .merge_patient_phi(&patient_id, patient_phi.clone())
                .await?;
        }

        self.apply_anonymization(obj, &mapping)?;

        Ok(AnonymizationOutcome {
            mapping,
            patient_phi,
            study_phi,
            series_phi,
        })
    }

    /// Resolve or create the anonymous identifiers for a patient.
    pub async fn anonymize_patient(
        &self,
        patient_name: &str,
        patient_id: &str,
    ) -> Result<MappingView> {
        if let Some(existing) = self
            .store
            .find_by_original(Some(patient_name), Some(patient_id))
            .await?
        {
            return Ok(existing);
        }

        let (mapping, created) = self.store.get_or_create(patient_name, patient_id).await?;
        if created {
            tracing::info!(
                original_name = %patient_name,
                original_id = %patient_id,
                anonymous_id = %mapping.anonymous_patient_id,
                "created patient anonymization mapping"
            );
        } else {
            tracing::debug!(
                original_id = %patient_id,
                anonymous_id = %mapping.anonymous_patient_id,
                "reusing existing patient mapping"
            );
        }
        Ok(mapping)
    }

    fn apply_anonymization(&self, obj: &mut InMemDicomObject, mapping: &MappingView) -> Result<()> {
        for tag in tags::anonymize_set() {
            let Some(existing) = obj.element(tag).ok().cloned() else {
                continue;
            };
            let vr = existing.header().vr();

            let replacement = if tag == IDENTIFIER_TAGS[0] {
                PrimitiveValue::from(mapping.anonymous_patient_name.as_str())
            } else if tag == IDENTIFIER_TAGS[1] {
                PrimitiveValue::from(mapping.anonymous_patient_id.as_str())
            } else if DATE_TAGS.contains(&tag) {
                PrimitiveValue::from(ANON_DATE)
            } else if TIME_TAGS.contains(&tag) {
                PrimitiveValue::from(ANON_TIME)
            } else {
                PrimitiveValue::from("")
            };

            obj.put(DataElement::new(tag, vr, replacement));
        }

        for tag in REMOVE_TAGS {
            obj.remove_element(*tag);
        }

        remove_private_tags(obj);

        tracing::debug!(
            original_name = %mapping.original_patient_name,
            anonymous_name = %mapping.anonymous_patient_name,
            "applied anonymization"
        );

        Ok(())
    }
}

fn extract_level(obj: &InMemDicomObject, level_tags: &[Tag]) -> HashMap<String, String> {
    let mut phi = HashMap::new();
    for tag in level_tags {
        if let Some(value) = string_value(obj, *tag) {
            if !value.is_empty() {
                phi.insert(tag_keyword(*tag), value);
            }
        }
    }
    phi
}

fn string_value(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e: &InMemElement| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn tag_keyword(tag: Tag) -> String {
    StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.alias.to_string())
        .unwrap_or_else(|| tag.to_string())
}

fn remove_private_tags(obj: &mut InMemDicomObject) {
    let private: Vec<Tag> = obj
        .iter()
        .map(|elem| elem.tag())
        .filter(|tag| tag.group() % 2 == 1)
        .collect();
    for tag in private {
        obj.remove_element(tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
            let mut rows = self.rows.lock().unwrap();
            if let Some(existing) = rows
                .iter()
                .find(|m| m.original_patient_id == original_id)
                .cloned()
            {
                return Ok((existing, false));
            }
            let anon = MappingView::deterministic_anonymous_id(original_id);
            let view = MappingView {
                original_patient_name: original_name.to_string(),
                original_patient_id: original_id.to_string(),
                anonymous_patient_name: anon.clone(),
                anonymous_patient_id: anon,
                patient_level_phi: HashMap::new(),
            };
            rows.push(view.clone());
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
            original_patient_id: &str,
            phi: HashMap<String, String>,
        ) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows
                .iter_mut()
                .find(|m| m.original_patient_id == original_patient_id)
            {
                for (k, v) in phi {
                    row.patient_level_phi.entry(k).or_insert(v);
                }
            }
            Ok(())
        }

        async fn all(&self) -> Result<Vec<MappingView>> {
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn deterministic_anonymous_id_is_derived_from_original_id() {
        let store: Arc<dyn PatientMappingStore> = Arc::new(MemoryStore::default());
        let anonymizer = Anonymizer::new(store);
        let mapping = anonymizer
            .anonymize_patient("DOE^JOHN", "PID123")
            .await
            .unwrap();
        assert_eq!(mapping.anonymous_patient_id, "ANON-PID123");
        assert_eq!(mapping.anonymous_patient_name, "ANON-PID123");
    }

    #[tokio::test]
    async fn repeated_anonymize_reuses_mapping() {
        let store: Arc<dyn PatientMappingStore> = Arc::new(MemoryStore::default());
        let anonymizer = Anonymizer::new(store);
        let first = anonymizer.anonymize_patient("DOE^JOHN", "PID1").await.unwrap();
        let second = anonymizer.anonymize_patient("DOE^JOHN", "PID1").await.unwrap();
        assert_eq!(first.anonymous_patient_id, second.anonymous_patient_id);
    }
}
