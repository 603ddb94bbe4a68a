//! Common types for DIMSE operations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// DIMSE command types handled by the SCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimseCommand {
    Echo,
    Find,
    Get,
    Move,
    Store,
}

/// DICOM query/retrieve levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    Patient,
    Study,
    Series,
    Image,
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = crate::error::DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" | "INSTANCE" => Ok(QueryLevel::Image),
            other => Err(crate::error::DimseError::config(format!(
                "invalid query retrieve level: {other}"
            ))),
        }
    }
}

/// Priority carried in the C-FIND/C-GET/C-MOVE command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0002 => Priority::Low,
            0x0001 => Priority::High,
            _ => Priority::Medium,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Priority::Low => 0x0002,
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
        }
    }
}

/// Outcome of dispatching one instance to one move destination, rolled up
/// by the caller into the C-MOVE-RSP sub-operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubOperationOutcome {
    Completed,
    Failed,
    Warning,
}

/// Running totals for a C-MOVE or C-GET response, sent as pending updates
/// and a final summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubOperationCounters {
    pub remaining: u32,
    pub completed: u32,
    pub failed: u32,
    pub warning: u32,
}

impl SubOperationCounters {
    pub fn record(&mut self, outcome: SubOperationOutcome) {
        match outcome {
            SubOperationOutcome::Completed => self.completed += 1,
            SubOperationOutcome::Failed => self.failed += 1,
            SubOperationOutcome::Warning => self.warning += 1,
        }
        if self.remaining > 0 {
            self.remaining -= 1;
        }
    }
}

/// Standard DIMSE status codes used by this proxy's handlers.
/// See PS3.7 Annex C.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const CANCEL: u16 = 0xFE00;
    pub const REFUSED: u16 = 0xC001;
    pub const PROCESSING_FAILURE: u16 = 0xC000;
    pub const OUT_OF_RESOURCES_SUB_OPERATIONS: u16 = 0xA700;
    pub const OUT_OF_RESOURCES_MATCHES: u16 = 0xA701;
    pub const IDENTIFIER_DOES_NOT_MATCH: u16 = 0xA900;
    pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
    pub const SUB_OPERATIONS_COMPLETE_WITH_FAILURES: u16 = 0xB000;
}

/// A single DICOM element value surfaced in a C-FIND query/response that the
/// caller builds from or matches against a staged/stored instance.
pub type AttributeMap = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_level_parsing() {
        assert_eq!("PATIENT".parse::<QueryLevel>().unwrap(), QueryLevel::Patient);
        assert_eq!("study".parse::<QueryLevel>().unwrap(), QueryLevel::Study);
        assert!("INVALID".parse::<QueryLevel>().is_err());
    }

    #[test]
    fn sub_operation_counters_decrement_remaining() {
        let mut counters = SubOperationCounters {
            remaining: 2,
            ..Default::default()
        };
        counters.record(SubOperationOutcome::Completed);
        assert_eq!(counters.remaining, 1);
        assert_eq!(counters.completed, 1);
    }
}
