//! Per-series `instances.xml` index (§4.4).
//!
//! Rewritten atomically on every append/update: serialize to a temp file in
//! the series directory, fsync, then rename over the existing index. Readers
//! never observe a partially-written file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::models::InstanceRecord;

const INDEX_FILE_NAME: &str = "instances.xml";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "instances")]
struct InstanceIndexDocument {
    #[serde(rename = "instance", default)]
    instances: Vec<InstanceRecord>,
}

/// Handle to one series directory's instance index.
pub struct InstanceIndex {
    path: PathBuf,
}

impl InstanceIndex {
    pub fn new(series_dir: &Path) -> Self {
        Self {
            path: series_dir.join(INDEX_FILE_NAME),
        }
    }

    pub fn load(&self) -> io::Result<Vec<InstanceRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let document: InstanceIndexDocument = quick_xml::de::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(document.instances)
    }

    /// Insert or replace the entry for `record.sop_instance_uid` and rewrite
    /// the whole index atomically. Returns the full post-write instance list
    /// so the caller can recompute `Scan.instances_count` (I1).
    pub fn upsert(&self, record: InstanceRecord) -> io::Result<Vec<InstanceRecord>> {
        let mut instances = self.load()?;
        match instances
            .iter_mut()
            .find(|existing| existing.sop_instance_uid == record.sop_instance_uid)
        {
            Some(existing) => *existing = record,
            None => instances.push(record),
        }
        self.write_atomic(&instances)?;
        Ok(instances)
    }

    fn write_atomic(&self, instances: &[InstanceRecord]) -> io::Result<()> {
        let document = InstanceIndexDocument {
            instances: instances.to_vec(),
        };
        let xml = quick_xml::se::to_string(&document)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let tmp_path = parent.join(format!(
            ".{INDEX_FILE_NAME}.{}.tmp",
            std::process::id()
        ));
        {
            let mut tmp_file = fs::File::create(&tmp_path)?;
            tmp_file.write_all(xml.as_bytes())?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
