use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Retrying,
}

/// Append-only upload attempt record for one Session.
///
/// Written only by the completion pipeline; never user-editable. A Session
/// in status `uploaded` must have at least one UploadLog with
/// `status = success` and a non-null `api_response_id` (I4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadLog {
    pub study_instance_uid: String,
    pub attempt_number: u32,
    pub status: UploadStatus,
    pub api_response_id: Option<String>,
    pub upload_file_size: Option<u64>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub chunk_index: Option<u32>,
    pub total_chunks: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl UploadLog {
    pub fn start_attempt(study_instance_uid: impl Into<String>, attempt_number: u32) -> Self {
        let now = Utc::now();
        Self {
            study_instance_uid: study_instance_uid.into(),
            attempt_number,
            status: UploadStatus::InProgress,
            api_response_id: None,
            upload_file_size: None,
            error_message: None,
            error_code: None,
            started_at: now,
            completed_at: None,
            duration_seconds: None,
            chunk_index: None,
            total_chunks: None,
            created_at: now,
        }
    }

    pub fn mark_success(&mut self, api_response_id: impl Into<String>, upload_file_size: u64) {
        let completed_at = Utc::now();
        self.status = UploadStatus::Success;
        self.api_response_id = Some(api_response_id.into());
        self.upload_file_size = Some(upload_file_size);
        self.duration_seconds = Some((completed_at - self.started_at).num_milliseconds() as f64 / 1000.0);
        self.completed_at = Some(completed_at);
    }

    pub fn mark_failed(&mut self, error_message: impl Into<String>, error_code: impl Into<String>) {
        let completed_at = Utc::now();
        self.status = UploadStatus::Failed;
        self.error_message = Some(error_message.into());
        self.error_code = Some(error_code.into());
        self.duration_seconds = Some((completed_at - self.started_at).num_milliseconds() as f64 / 1000.0);
        self.completed_at = Some(completed_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_success_requires_no_prior_state() {
        let mut log = UploadLog::start_attempt("1.2.3", 1);
        log.mark_success("resp-1", 4096);
        assert_eq!(log.status, UploadStatus::Success);
        assert_eq!(log.api_response_id.as_deref(), Some("resp-1"));
        assert!(log.completed_at.is_some());
    }

    #[test]
    fn mark_failed_records_error_details() {
        let mut log = UploadLog::start_attempt("1.2.3", 2);
        log.mark_failed("connection reset", "ECONNRESET");
        assert_eq!(log.status, UploadStatus::Failed);
        assert_eq!(log.error_code.as_deref(), Some("ECONNRESET"));
    }
}
