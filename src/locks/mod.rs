//! Dispatch lock manager (§4.10), grounded on the original
//! `DispatchLockManager`: prevents the same (node, entity) pair from being
//! dispatched to concurrently by two event handlers racing each other.
//!
//! Unlike the Python original's manual acquire/release pair, lock release
//! here is RAII: dropping the returned [`LockGuard`] releases the lock, so a
//! handler that returns early (or panics) can't leak one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Subject,
    Session,
    Scan,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::Subject => write!(f, "subject"),
            EntityType::Session => write!(f, "session"),
            EntityType::Scan => write!(f, "scan"),
        }
    }
}

type LockKey = (String, EntityType, String);

/// Tracks in-flight dispatch operations keyed by (nodeID, entityType, entityID).
#[derive(Default)]
pub struct DispatchLockManager {
    active: Mutex<HashSet<LockKey>>,
}

/// RAII handle for one acquired lock. Releases automatically on drop.
pub struct LockGuard {
    manager: Arc<DispatchLockManager>,
    key: LockKey,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.key.0, self.key.1, &self.key.2);
    }
}

impl DispatchLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(HashSet::new()),
        })
    }

    fn lock_set(&self) -> std::sync::MutexGuard<'_, HashSet<LockKey>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attempt to acquire the lock for `(node_id, entity_type, entity_id)`.
    /// Returns `None` if another caller already holds it.
    pub fn try_acquire(
        self: &Arc<Self>,
        node_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Option<LockGuard> {
        let key = (node_id.to_string(), entity_type, entity_id.to_string());
        let mut active = self.lock_set();
        if active.contains(&key) {
            return None;
        }
        active.insert(key.clone());
        Some(LockGuard {
            manager: self.clone(),
            key,
        })
    }

    fn release(&self, node_id: &str, entity_type: EntityType, entity_id: &str) {
        let key = (node_id.to_string(), entity_type, entity_id.to_string());
        self.lock_set().remove(&key);
    }

    pub fn is_locked(&self, node_id: &str, entity_type: EntityType, entity_id: &str) -> bool {
        let key = (node_id.to_string(), entity_type, entity_id.to_string());
        self.lock_set().contains(&key)
    }

    pub fn active_lock_count(&self) -> usize {
        self.lock_set().len()
    }

    pub fn get_active_locks(&self) -> Vec<(String, EntityType, String)> {
        self.lock_set().iter().cloned().collect()
    }

    /// Release every held lock. Recovery tool for stuck dispatches; mirrors
    /// the Python original's `clear_all_locks`.
    pub fn clear_all_locks(&self) -> usize {
        let mut active = self.lock_set();
        let count = active.len();
        active.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_same_key_fails_while_first_is_held() {
        let manager = DispatchLockManager::new();
        let first = manager.try_acquire("node-1", EntityType::Scan, "scan-1").unwrap();
        assert!(manager.try_acquire("node-1", EntityType::Scan, "scan-1").is_none());
        drop(first);
        assert!(manager.try_acquire("node-1", EntityType::Scan, "scan-1").is_some());
    }

    #[test]
    fn different_nodes_or_entities_do_not_contend() {
        let manager = DispatchLockManager::new();
        let _a = manager.try_acquire("node-1", EntityType::Scan, "scan-1").unwrap();
        assert!(manager.try_acquire("node-2", EntityType::Scan, "scan-1").is_some());
        assert!(manager.try_acquire("node-1", EntityType::Session, "scan-1").is_some());
    }

    #[test]
    fn dropping_guard_releases_the_lock() {
        let manager = DispatchLockManager::new();
        {
            let _guard = manager.try_acquire("node-1", EntityType::Subject, "pat-1").unwrap();
            assert!(manager.is_locked("node-1", EntityType::Subject, "pat-1"));
        }
        assert!(!manager.is_locked("node-1", EntityType::Subject, "pat-1"));
    }

    #[test]
    fn clear_all_locks_returns_count_and_empties_set() {
        let manager = DispatchLockManager::new();
        let _a = manager.try_acquire("node-1", EntityType::Scan, "scan-1").unwrap();
        let _b = manager.try_acquire("node-2", EntityType::Scan, "scan-2").unwrap();
        assert_eq!(manager.active_lock_count(), 2);
        assert_eq!(manager.clear_all_locks(), 2);
        assert_eq!(manager.active_lock_count(), 0);
    }
}
