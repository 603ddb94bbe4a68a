//! Scenario 5 (spec.md §8): a `scan.dispatch` naming two candidate nodes
//! resolves to only the one that is active, reachable and write-permissioned
//! — the read-only node is never a dispatch target.

use pacsproxy::models::{NodeConfig, Permission};
use pacsproxy::nodes::NodeRegistry;

fn node(id: &str, permission: Permission, is_active: bool, is_reachable: bool) -> NodeConfig {
    NodeConfig {
        node_id: id.to_string(),
        name: id.to_string(),
        ae_title: id.to_uppercase(),
        host: "10.0.0.1".to_string(),
        port: 104,
        is_active,
        is_reachable,
        permission,
        connection_timeout_secs: 30,
        max_pdu_size: 16384,
        retry_count: 3,
        retry_delay_secs: 5,
    }
}

#[test]
fn only_the_writable_node_is_selected_from_two_candidates() {
    let registry = NodeRegistry::new();
    registry.replace_all(vec![
        node("writer", Permission::ReadWrite, true, true),
        node("reader", Permission::Read, true, true),
    ]);

    let requested = vec!["writer".to_string(), "reader".to_string()];
    let targets = registry.active_reachable_writable(&requested);

    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].node_id, "writer");
}

#[test]
fn an_unreachable_writable_node_is_excluded_too() {
    let registry = NodeRegistry::new();
    registry.replace_all(vec![
        node("writer-up", Permission::ReadWrite, true, true),
        node("writer-down", Permission::ReadWrite, true, false),
    ]);

    let requested = vec!["writer-up".to_string(), "writer-down".to_string()];
    let targets = registry.active_reachable_writable(&requested);

    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].node_id, "writer-up");
}
