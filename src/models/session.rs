use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PhiMap;

/// Lifecycle state of a Session (Study), advancing monotonically forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Incomplete,
    Complete,
    Uploaded,
    Archived,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Incomplete => write!(f, "incomplete"),
            SessionStatus::Complete => write!(f, "complete"),
            SessionStatus::Uploaded => write!(f, "uploaded"),
            SessionStatus::Archived => write!(f, "archived"),
        }
    }
}

/// One DICOM study in progress or already finalized/uploaded.
///
/// Keyed externally by `study_instance_uid`. Identifier fields carry only
/// anonymized values once PHI anonymization has run (I2); original values
/// live in `study_level_phi`, merged from the PatientMapping-owned PHI
/// engine during C-STORE handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub study_instance_uid: String,
    pub patient_name: String,
    pub patient_id: String,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    pub status: SessionStatus,
    pub last_received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub storage_path: String,
    pub study_level_phi: PhiMap,
}

impl Session {
    pub fn new(study_instance_uid: impl Into<String>, storage_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            study_instance_uid: study_instance_uid.into(),
            patient_name: String::new(),
            patient_id: String::new(),
            study_date: None,
            study_time: None,
            study_description: None,
            accession_number: None,
            status: SessionStatus::Incomplete,
            last_received_at: now,
            completed_at: None,
            storage_path: storage_path.into(),
            study_level_phi: PhiMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_received_at = Utc::now();
    }

    /// Advance to `complete`, satisfying the I4 precondition for a later
    /// transition to `uploaded`.
    pub fn finalize(&mut self) {
        self.status = SessionStatus::Complete;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_incomplete() {
        let session = Session::new("1.2.3", "/tmp/1.2.3");
        assert_eq!(session.status, SessionStatus::Incomplete);
        assert!(session.completed_at.is_none());
    }

    #[test]
    fn finalize_sets_completed_at() {
        let mut session = Session::new("1.2.3", "/tmp/1.2.3");
        session.finalize();
        assert_eq!(session.status, SessionStatus::Complete);
        assert!(session.completed_at.is_some());
    }
}
