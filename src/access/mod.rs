//! Access control for inbound DIMSE associations (spec.md §4.12).
//!
//! Public mode allows every verb from every calling AE; private mode maps
//! each inbound association's calling AE title (optionally disambiguated by
//! peer IP) to a known, active [`NodeConfig`] and checks its permission.
//! C-MOVE carries an extra check independent of mode: the move destination
//! AE must itself resolve to a known, active node.

use std::sync::Arc;

use crate::config::Mode;
use crate::models::NodeConfig;
use crate::nodes::NodeRegistry;

/// The DIMSE verb an inbound association is attempting, used to pick the
/// permission predicate a private-mode node must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Store,
    Find,
    Get,
    Move,
}

impl Verb {
    fn permits(self, node: &NodeConfig) -> bool {
        match self {
            Verb::Store => node.permission.can_write(),
            Verb::Find | Verb::Get | Verb::Move => node.permission.can_read(),
        }
    }
}

/// Result of an access check. Callers map `Refused` to DIMSE status
/// `0xC001` (`status::REFUSED`) per spec.md §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Refused,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Evaluates access decisions against the live `NodeRegistry`. Cheap to
/// clone; holds only an `Arc`.
#[derive(Clone)]
pub struct AccessControl {
    nodes: Arc<NodeRegistry>,
}

impl AccessControl {
    pub fn new(nodes: Arc<NodeRegistry>) -> Self {
        Self { nodes }
    }

    /// Check whether `calling_ae` (connecting from `peer_ip`) may perform
    /// `verb` under `mode`.
    pub fn check(&self, mode: Mode, verb: Verb, calling_ae: &str, peer_ip: &str) -> Decision {
        if mode == Mode::Public {
            return Decision::Allowed;
        }

        match self.nodes.find_by_ae_title(calling_ae, Some(peer_ip)) {
            Some(node) if node.is_active && verb.permits(&node) => Decision::Allowed,
            _ => Decision::Refused,
        }
    }

    /// C-MOVE's additional check: the requested move destination AE must map
    /// to a known, active node, regardless of access mode.
    pub fn check_move_destination(&self, destination_ae: &str) -> Decision {
        if self.nodes.is_known_active_destination(destination_ae) {
            Decision::Allowed
        } else {
            Decision::Refused
        }
    }
}
