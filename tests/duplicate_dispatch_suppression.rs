//! Scenario 6 (spec.md §8): two overlapping dispatch requests for the same
//! (node, entity) pair must not run concurrently — the second is suppressed
//! until the first's lock guard is released.

use pacsproxy::locks::{DispatchLockManager, EntityType};

#[test]
fn a_second_dispatch_for_the_same_target_is_suppressed_while_the_first_is_in_flight() {
    let locks = DispatchLockManager::new();

    let first = locks
        .try_acquire("node-1", EntityType::Scan, "1.2.840.113619.2.9.1")
        .expect("first dispatch should acquire the lock");

    let second = locks.try_acquire("node-1", EntityType::Scan, "1.2.840.113619.2.9.1");
    assert!(second.is_none(), "a concurrent dispatch to the same node/entity must be suppressed");

    drop(first);

    let retried = locks.try_acquire("node-1", EntityType::Scan, "1.2.840.113619.2.9.1");
    assert!(retried.is_some(), "once the in-flight dispatch finishes, the next one may proceed");
}

#[test]
fn dispatches_to_different_nodes_for_the_same_entity_do_not_contend() {
    let locks = DispatchLockManager::new();
    let _a = locks
        .try_acquire("node-1", EntityType::Scan, "1.2.840.113619.2.9.1")
        .unwrap();
    let b = locks.try_acquire("node-2", EntityType::Scan, "1.2.840.113619.2.9.1");
    assert!(b.is_some(), "dispatch to a second node for the same entity is independent");
}
