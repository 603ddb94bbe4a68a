//! Repository interface this crate needs to persist/retrieve the
//! patient ↔ anonymous-identifier mapping. The concrete implementation
//! (redb-backed) lives alongside the other storage repositories; this crate
//! only depends on the trait so it has no database of its own.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// A snapshot of one patient mapping row as the PHI engine needs to see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingView {
    pub original_patient_name: String,
    pub original_patient_id: String,
    pub anonymous_patient_name: String,
    pub anonymous_patient_id: String,
    pub patient_level_phi: HashMap<String, String>,
}

impl MappingView {
    /// Deterministic anonymous identifier derived from the original patient
    /// ID (`ANON-<originalID>`), used both as the anonymous name and ID.
    pub fn deterministic_anonymous_id(original_patient_id: &str) -> String {
        format!("ANON-{original_patient_id}")
    }
}

/// Storage for the patient/anonymous-identifier mapping.
///
/// Implementations MUST make `get_or_create` atomic under concurrent callers
/// for the same `(original_name, original_id)` pair — on a race, recover by
/// re-reading the row the other caller created rather than erroring.
#[async_trait]
pub trait PatientMappingStore: Send + Sync {
    async fn get_or_create(
        &self,
        original_name: &str,
        original_id: &str,
    ) -> Result<(MappingView, bool)>;

    async fn find_by_anonymous(
        &self,
        anonymous_name: Option<&str>,
        anonymous_id: Option<&str>,
    ) -> Result<Option<MappingView>>;

    async fn find_by_original(
        &self,
        original_name: Option<&str>,
        original_id: Option<&str>,
    ) -> Result<Option<MappingView>>;

    /// Merge newly-observed patient-level PHI into the stored metadata.
    /// Existing keys are never overwritten with an empty value.
    async fn merge_patient_phi(
        &self,
        original_patient_id: &str,
        phi: HashMap<String, String>,
    ) -> Result<()>;

    async fn all(&self) -> Result<Vec<MappingView>>;
}
