//! Error types for PHI operations

use thiserror::Error;

/// Result type alias for PHI operations
pub type Result<T> = std::result::Result<T, PhiError>;

/// Error types that can occur during anonymization or resolution
#[derive(Error, Debug)]
pub enum PhiError {
    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("mapping store error: {0}")]
    Store(String),

    #[error("tag write failed for {tag}: {source}")]
    TagWrite {
        tag: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl PhiError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn dicom_object(msg: impl Into<String>) -> Self {
        Self::DicomObject(msg.into())
    }

    /// Whether the failure is local to a single tag and shouldn't abort the
    /// whole anonymize/resolve pass.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PhiError::TagWrite { .. })
    }
}
