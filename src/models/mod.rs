//! Persisted domain entities for the proxy.
//!
//! These are the record types backed by the redb repositories in
//! `crate::storage`. Each type mirrors exactly the attribute lists in the
//! data model: nothing here is an ORM-style active record, they are plain
//! structs moved in and out of storage by the repository layer.

pub mod node_config;
pub mod patient_mapping;
pub mod scan;
pub mod session;
pub mod upload_log;

pub use node_config::{NodeConfig, Permission};
pub use patient_mapping::PatientMapping;
pub use scan::{InstanceRecord, Scan};
pub use session::{Session, SessionStatus};
pub use upload_log::{UploadLog, UploadStatus};

/// String-keyed bag of PHI values lifted from a DICOM dataset. Used at the
/// patient, study and series level.
pub type PhiMap = std::collections::HashMap<String, String>;
