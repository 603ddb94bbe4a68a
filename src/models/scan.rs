use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PhiMap;

/// One series within a study.
///
/// Keyed externally by `series_instance_uid`. `instances_count` must always
/// equal the number of distinct `sop_instance_uid`s recorded in the series'
/// on-disk instance index (I1); overwrites of an existing SOP Instance UID
/// do not increment it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub series_instance_uid: String,
    pub study_instance_uid: String,
    pub series_number: Option<String>,
    pub modality: String,
    pub series_description: Option<String>,
    pub storage_path: String,
    pub instances_count: u32,
    pub series_level_phi: PhiMap,
}

impl Scan {
    pub fn new(
        series_instance_uid: impl Into<String>,
        study_instance_uid: impl Into<String>,
        modality: impl Into<String>,
        storage_path: impl Into<String>,
    ) -> Self {
        Self {
            series_instance_uid: series_instance_uid.into(),
            study_instance_uid: study_instance_uid.into(),
            series_number: None,
            modality: modality.into(),
            series_description: None,
            storage_path: storage_path.into(),
            instances_count: 0,
            series_level_phi: PhiMap::new(),
        }
    }
}

/// One entry in a series' `instances.xml` index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub sop_instance_uid: String,
    pub instance_number: Option<String>,
    pub file_name: String,
    pub file_size: u64,
    pub transfer_syntax_uid: String,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_scan_has_zero_instances() {
        let scan = Scan::new("1.2.3.1", "1.2.3", "CT", "/tmp/1.2.3/1.2.3.1");
        assert_eq!(scan.instances_count, 0);
        assert!(scan.series_level_phi.is_empty());
    }
}
