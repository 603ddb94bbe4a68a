use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PhiMap;

/// Original-to-anonymous identity mapping for one patient.
///
/// One row per (originalName, originalID) pair. `anonymousId` is always
/// `"ANON-" + originalId` (I3): deterministic, so re-ingesting the same
/// patient reuses the existing row instead of minting a new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatientMapping {
    pub original_name: String,
    pub original_id: String,
    pub anonymous_name: String,
    pub anonymous_id: String,
    pub patient_level_phi: PhiMap,
    pub created_at: DateTime<Utc>,
}

impl PatientMapping {
    /// Build the deterministic anonymous identifiers for an original patient ID.
    pub fn anonymous_id_for(original_id: &str) -> String {
        format!("ANON-{original_id}")
    }

    pub fn new(original_name: impl Into<String>, original_id: impl Into<String>) -> Self {
        let original_id = original_id.into();
        let anonymous_id = Self::anonymous_id_for(&original_id);
        Self {
            original_name: original_name.into(),
            anonymous_name: anonymous_id.clone(),
            original_id,
            anonymous_id,
            patient_level_phi: PhiMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Merge newly observed patient-level PHI into the mapping. Never
    /// overwrites an existing non-empty value with an empty one (§4.3 step 4).
    pub fn merge_phi(&mut self, observed: PhiMap) {
        for (key, value) in observed {
            if value.is_empty() {
                continue;
            }
            self.patient_level_phi
                .entry(key)
                .and_modify(|existing| {
                    if existing.is_empty() {
                        *existing = value.clone();
                    }
                })
                .or_insert(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_id_is_deterministic() {
        assert_eq!(PatientMapping::anonymous_id_for("12345"), "ANON-12345");
        assert_eq!(
            PatientMapping::anonymous_id_for("12345"),
            PatientMapping::anonymous_id_for("12345")
        );
    }

    #[test]
    fn merge_phi_does_not_clobber_existing_values_with_empty() {
        let mut mapping = PatientMapping::new("Doe^John", "12345");
        mapping.merge_phi(PhiMap::from([("PatientSex".to_string(), "M".to_string())]));

        mapping.merge_phi(PhiMap::from([("PatientSex".to_string(), "".to_string())]));
        assert_eq!(mapping.patient_level_phi.get("PatientSex").unwrap(), "M");
    }
}
