//! In-memory `NodeConfig` registry (spec.md §3: "Lives in memory only,
//! refreshed from the backend").
//!
//! The registry holds no durable state of its own; `replace_all` is called
//! whenever the backend's node list changes (on startup and on
//! `proxy.nodes_changed` control-channel events, §4.9).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::{NodeConfig, Permission};

/// Process-wide table of configured PACS peers, keyed by `node_id`.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeConfig>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, NodeConfig>> {
        self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, NodeConfig>> {
        self.nodes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wholesale swap of the registry contents, as done on a backend refresh.
    pub fn replace_all(&self, nodes: Vec<NodeConfig>) {
        let mut table = self.write();
        table.clear();
        for node in nodes {
            table.insert(node.node_id.clone(), node);
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeConfig> {
        self.read().get(node_id).cloned()
    }

    pub fn all(&self) -> Vec<NodeConfig> {
        self.read().values().cloned().collect()
    }

    pub fn set_reachable(&self, node_id: &str, reachable: bool) {
        if let Some(node) = self.write().get_mut(node_id) {
            node.is_reachable = reachable;
        }
    }

    /// Active nodes, by id.
    pub fn active_node_ids(&self) -> Vec<String> {
        self.read()
            .values()
            .filter(|n| n.is_active)
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// §4.9 step 1: intersect a requested set of node ids with the active,
    /// reachable, write-permissioned nodes.
    pub fn active_reachable_writable(&self, requested: &[String]) -> Vec<NodeConfig> {
        let table = self.read();
        requested
            .iter()
            .filter_map(|id| table.get(id))
            .filter(|n| n.is_active && n.is_reachable && n.permission.can_write())
            .cloned()
            .collect()
    }

    /// `scan.new_scan_available`'s special target set (§4.9): every active,
    /// reachable node with read or read_write permission, independent of any
    /// requested node list.
    pub fn all_active_reachable_readable(&self) -> Vec<NodeConfig> {
        self.read()
            .values()
            .filter(|n| n.is_active && n.is_reachable && n.permission.can_read())
            .cloned()
            .collect()
    }

    /// §4.11: look up the peer by its calling AE title, disambiguating by
    /// peer IP when more than one active node shares the title.
    pub fn find_by_ae_title(&self, calling_ae: &str, peer_ip: Option<&str>) -> Option<NodeConfig> {
        let table = self.read();
        let matches: Vec<&NodeConfig> = table.values().filter(|n| n.matches_ae_title(calling_ae)).collect();
        if matches.len() <= 1 {
            return matches.first().map(|n| (*n).clone());
        }
        if let Some(ip) = peer_ip {
            if let Some(found) = matches.iter().find(|n| n.host == ip) {
                return Some((*found).clone());
            }
        }
        matches.first().map(|n| (*n).clone())
    }

    /// C-MOVE's extra check: the move destination AE maps to a known, active
    /// node, independent of permission.
    pub fn is_known_active_destination(&self, destination_ae: &str) -> bool {
        self.read()
            .values()
            .any(|n| n.is_active && n.matches_ae_title(destination_ae))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, ae: &str, permission: Permission, active: bool, reachable: bool) -> NodeConfig {
        NodeConfig {
            node_id: id.to_string(),
            name: id.to_string(),
            ae_title: ae.to_string(),
            host: "10.0.0.1".to_string(),
            port: 104,
            is_active: active,
            is_reachable: reachable,
            permission,
            connection_timeout_secs: 10,
            max_pdu_size: 16384,
            retry_count: 3,
            retry_delay_secs: 2,
        }
    }

    #[test]
    fn replace_all_swaps_the_whole_table() {
        let registry = NodeRegistry::new();
        registry.replace_all(vec![node("a", "AETA", Permission::Read, true, true)]);
        assert_eq!(registry.all().len(), 1);
        registry.replace_all(vec![
            node("b", "AETB", Permission::Write, true, true),
            node("c", "AETC", Permission::Write, true, true),
        ]);
        assert_eq!(registry.all().len(), 2);
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn active_reachable_writable_filters_correctly() {
        let registry = NodeRegistry::new();
        registry.replace_all(vec![
            node("a", "AETA", Permission::Write, true, true),
            node("b", "AETB", Permission::Read, true, true),
            node("c", "AETC", Permission::Write, true, false),
            node("d", "AETD", Permission::Write, false, true),
        ]);
        let requested = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let result = registry.active_reachable_writable(&requested);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].node_id, "a");
    }

    #[test]
    fn find_by_ae_title_disambiguates_by_peer_ip() {
        let registry = NodeRegistry::new();
        let mut a = node("a", "SHARED", Permission::Read, true, true);
        a.host = "10.0.0.1".to_string();
        let mut b = node("b", "SHARED", Permission::Read, true, true);
        b.host = "10.0.0.2".to_string();
        registry.replace_all(vec![a, b]);

        let found = registry.find_by_ae_title("SHARED", Some("10.0.0.2")).unwrap();
        assert_eq!(found.node_id, "b");
    }

    #[test]
    fn set_reachable_updates_in_place() {
        let registry = NodeRegistry::new();
        registry.replace_all(vec![node("a", "AETA", Permission::Read, true, false)]);
        registry.set_reachable("a", true);
        assert!(registry.get("a").unwrap().is_reachable);
    }
}
