//! Logical actor addressing.
//!
//! An [`Address`] names one actor in the cluster: a signed 16-bit node
//! id plus the actor's index into that node's actor table. Node ids
//! start at 1; nodeid 0 means "unset" and is how routing tables mark an
//! unresolved slot.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster node identifier. Valid nodes are numbered from 1.
pub type NodeId = i16;

/// Reserved actor id: the node's topology manager.
pub const ACTORID_TOPOLOGY_MGR: i16 = 1;
/// Reserved actor id: the replica's deadlock manager.
pub const ACTORID_DEADLOCK_MGR: i16 = 2;
/// Reserved actor id: the replica's user/schema manager.
pub const ACTORID_USERSCHEMA_MGR: i16 = 3;
/// Reserved actor id: the node's listener.
pub const ACTORID_LISTENER: i16 = 4;

/// First dynamically assigned actor id. Broadcast scans start here so
/// the singleton slots above are never matched by type queries.
pub const FIRST_ACTORID: i16 = 5;

/// Logical address of one actor: `{nodeid, actorid}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub nodeid: NodeId,
    pub actorid: i16,
}

impl Address {
    pub fn new(nodeid: NodeId, actorid: i16) -> Self {
        Self { nodeid, actorid }
    }

    /// True when this address has been filled in (nodeid 0 is the
    /// unresolved sentinel throughout the routing tables).
    pub fn is_resolved(&self) -> bool {
        self.nodeid != 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.nodeid, self.actorid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_address_is_unresolved() {
        assert!(!Address::default().is_resolved());
        assert!(Address::new(1, FIRST_ACTORID).is_resolved());
    }

    #[test]
    fn reserved_ids_precede_dynamic_range() {
        for id in [
            ACTORID_TOPOLOGY_MGR,
            ACTORID_DEADLOCK_MGR,
            ACTORID_USERSCHEMA_MGR,
            ACTORID_LISTENER,
        ] {
            assert!(id < FIRST_ACTORID);
        }
    }
}
