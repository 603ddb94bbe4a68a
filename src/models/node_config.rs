use serde::{Deserialize, Serialize};

/// Access a peer PACS is granted to an entity dispatched through this proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    ReadWrite,
    None,
}

impl Permission {
    pub fn can_read(self) -> bool {
        matches!(self, Permission::Read | Permission::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Permission::Write | Permission::ReadWrite)
    }
}

/// One configured PACS peer (spec.md §3 `NodeConfig`).
///
/// Lives in memory only: the registry in `crate::nodes` is refreshed
/// wholesale from the backend's node list, never persisted locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub name: String,
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    pub is_active: bool,
    #[serde(default)]
    pub is_reachable: bool,
    pub permission: Permission,
    /// Seconds. Stored as a plain integer (not `Duration`) since this is
    /// the shape the backend's JSON node list uses.
    pub connection_timeout_secs: u64,
    pub max_pdu_size: u32,
    pub retry_count: u32,
    pub retry_delay_secs: u64,
}

impl NodeConfig {
    /// `aeTitle` must fit the 16-char AE title field (§3 invariant).
    pub fn ae_title_is_valid(&self) -> bool {
        !self.ae_title.is_empty() && self.ae_title.len() <= 16
    }

    pub fn matches_ae_title(&self, calling_ae: &str) -> bool {
        self.ae_title.trim().eq_ignore_ascii_case(calling_ae.trim())
    }

    pub fn connection_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeConfig {
        NodeConfig {
            node_id: "node-1".into(),
            name: "Test PACS".into(),
            ae_title: "TESTSCP".into(),
            host: "10.0.0.5".into(),
            port: 104,
            is_active: true,
            is_reachable: false,
            permission: Permission::ReadWrite,
            connection_timeout_secs: 10,
            max_pdu_size: 16384,
            retry_count: 3,
            retry_delay_secs: 2,
        }
    }

    #[test]
    fn ae_title_over_16_chars_is_invalid() {
        let mut node = sample();
        node.ae_title = "A".repeat(17);
        assert!(!node.ae_title_is_valid());
    }

    #[test]
    fn ae_title_match_is_case_insensitive_and_trims() {
        let node = sample();
        assert!(node.matches_ae_title(" testscp "));
        assert!(!node.matches_ae_title("OTHERSCP"));
    }

    #[test]
    fn permission_predicates() {
        assert!(Permission::ReadWrite.can_read());
        assert!(Permission::ReadWrite.can_write());
        assert!(Permission::Read.can_read());
        assert!(!Permission::Read.can_write());
        assert!(!Permission::None.can_read());
        assert!(!Permission::None.can_write());
    }
}
