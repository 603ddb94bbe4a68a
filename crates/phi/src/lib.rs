//! PHI classification, anonymization and de-anonymization for DICOM datasets.
//!
//! Tag classification is split into three levels (patient/study/series) so
//! callers can persist each level against the record it belongs to. The
//! actual persistence of the patient/anonymous-identifier mapping is left to
//! whatever implements [`PatientMappingStore`] — this crate never touches a
//! database directly.

pub mod anonymizer;
pub mod error;
pub mod mapping;
pub mod resolver;
pub mod tags;

pub use anonymizer::{AnonymizationOutcome, Anonymizer};
pub use error::{PhiError, Result};
pub use mapping::{MappingView, PatientMappingStore};
pub use resolver::PhiResolver;
pub use tags::TagLevel;
