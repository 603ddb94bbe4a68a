//! Error types for backend HTTP client operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid proxy key")]
    InvalidProxyKey,

    #[error("proxy is inactive")]
    ProxyInactive,

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("response body was not valid JSON: {0}")]
    InvalidJson(String),
}

impl BackendError {
    /// §4.7: 401/403/404 are never retried. Everything else (network
    /// errors, 5xx, and per §4.6 step 6 also 408/429) may be.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Request(_) | BackendError::Io(_) => true,
            BackendError::UnexpectedStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            BackendError::InvalidProxyKey
            | BackendError::ProxyInactive
            | BackendError::NotFound(_)
            | BackendError::InvalidJson(_) => false,
        }
    }
}

/// Classify a non-2xx response status into the error taxonomy §4.7 names
/// explicitly (401/403/404), falling back to the generic status variant.
pub fn classify_status(status: u16, body: String) -> BackendError {
    match status {
        401 => BackendError::InvalidProxyKey,
        403 => BackendError::ProxyInactive,
        404 => BackendError::NotFound(body),
        other => BackendError::UnexpectedStatus { status: other, body },
    }
}
