//! Cluster topology: the authoritative view each actor routes by.
//!
//! The topology manager owns a [`SharedTopology`]; every other actor
//! holds its own possibly-stale [`Topology`] copy, refreshed on demand
//! by [`Mboxes::update`](crate::Mboxes::update) when the manager
//! announces a change. The shared side is mutated under its mutex and
//! carries a version so registries can skip rebuilds that would be
//! no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use types::{Address, NodeId};

use crate::mbox::Mbox;

/// Role of an actor within the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorType {
    /// Placeholder for an empty actor-table slot.
    None,
    TransactionAgent,
    Engine,
    TopologyMgr,
    Listener,
    UserSchemaMgr,
    DeadlockMgr,
    IbGateway,
    ObGateway,
}

/// One slot in a node's actor table.
#[derive(Debug, Clone)]
pub struct ActorEntry {
    pub actortype: ActorType,
    /// Instance number within the type (transaction agent 0, 1, ...).
    pub instance: i16,
    /// Mailbox handle for local actors; `None` for empty slots and for
    /// entries describing actors on other nodes.
    pub mbox: Option<Arc<Mbox>>,
}

impl ActorEntry {
    fn empty() -> Self {
        Self {
            actortype: ActorType::None,
            instance: 0,
            mbox: None,
        }
    }
}

/// Authoritative description of cluster membership, actor placement
/// and partition assignment, as seen from one node.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub nodeid: NodeId,
    /// Bumped by [`SharedTopology::publish`] on every change.
    pub version: u64,

    /// This node's actor table, indexed by actor id. Slot 0 is unused;
    /// reserved singleton ids start at 1.
    pub actor_list: Vec<ActorEntry>,

    pub num_transaction_agents: usize,
    pub num_engines: usize,
    pub num_partitions: usize,
    pub num_obgateways: usize,

    /// Partition id -> owning actor address within this replica.
    pub partition_list_this_replica: Vec<Address>,

    /// `all_actors[nodeid][actorid]` = actor type, for the whole
    /// cluster. Row 0 is unused (node ids start at 1).
    pub all_actors: Vec<Vec<ActorType>>,
    /// The same grid restricted to the local replica's nodes.
    pub all_actors_this_replica: HashMap<NodeId, Vec<ActorType>>,

    /// Home node of the user-schema manager when it is not local
    /// (0 = local/unset).
    pub userschema_mgr_node: NodeId,
    /// Home node of the deadlock manager when it is not local.
    pub deadlock_mgr_node: NodeId,

    /// Inbound-gateway endpoints per node: `{host, port}`, consumed by
    /// the gateway actors, carried here for a consistent cluster view.
    pub ib_gateways: HashMap<NodeId, (String, String)>,
}

impl Topology {
    pub fn new(nodeid: NodeId) -> Self {
        Self {
            nodeid,
            // Slot 0 stays empty so actor ids can index directly.
            actor_list: vec![ActorEntry::empty()],
            ..Self::default()
        }
    }

    /// Append an actor to the local table, returning its actor id.
    /// Also records its type in the cluster grid.
    pub fn add_actor(
        &mut self,
        actortype: ActorType,
        instance: i16,
        mbox: Option<Arc<Mbox>>,
    ) -> i16 {
        let actorid = self.actor_list.len() as i16;
        self.actor_list.push(ActorEntry {
            actortype,
            instance,
            mbox,
        });
        self.record_actor_type(self.nodeid, actorid, actortype, true);
        actorid
    }

    /// Record one actor's type in the cluster grid (and, when the node
    /// belongs to the local replica, in the per-replica grid).
    pub fn record_actor_type(
        &mut self,
        nodeid: NodeId,
        actorid: i16,
        actortype: ActorType,
        this_replica: bool,
    ) {
        let node = nodeid as usize;
        let actor = actorid as usize;
        if self.all_actors.len() <= node {
            self.all_actors.resize(node + 1, Vec::new());
        }
        if self.all_actors[node].len() <= actor {
            self.all_actors[node].resize(actor + 1, ActorType::None);
        }
        self.all_actors[node][actor] = actortype;

        if this_replica {
            let row = self.all_actors_this_replica.entry(nodeid).or_default();
            if row.len() <= actor {
                row.resize(actor + 1, ActorType::None);
            }
            row[actor] = actortype;
        }
    }

    /// Assign a partition to its owning actor address.
    pub fn set_partition_owner(&mut self, partitionid: usize, owner: Address) {
        if self.partition_list_this_replica.len() <= partitionid {
            self.partition_list_this_replica
                .resize(partitionid + 1, Address::default());
        }
        self.partition_list_this_replica[partitionid] = owner;
        self.num_partitions = self.num_partitions.max(partitionid + 1);
    }
}

/// The node-wide authoritative topology, behind its one mutex.
///
/// Registry rebuilds take the lock only long enough to clone a
/// snapshot; routing never holds it.
#[derive(Debug, Clone, Default)]
pub struct SharedTopology {
    inner: Arc<Mutex<Topology>>,
}

impl SharedTopology {
    pub fn new(topology: Topology) -> Self {
        Self {
            inner: Arc::new(Mutex::new(topology)),
        }
    }

    /// Mutate the authoritative topology and bump its version.
    pub fn publish<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Topology),
    {
        let mut guard = self.inner.lock();
        mutate(&mut guard);
        guard.version += 1;
    }

    /// Copy out a consistent snapshot for one actor's local view.
    pub fn snapshot(&self) -> Topology {
        self.inner.lock().clone()
    }

    /// Current version without copying the whole topology.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_actor_assigns_sequential_ids_and_fills_grid() {
        let mut top = Topology::new(1);
        let a = top.add_actor(ActorType::TopologyMgr, 0, None);
        let b = top.add_actor(ActorType::TransactionAgent, 0, None);
        assert_eq!((a, b), (1, 2));
        assert_eq!(top.all_actors[1][2], ActorType::TransactionAgent);
        assert_eq!(
            top.all_actors_this_replica[&1][1],
            ActorType::TopologyMgr
        );
    }

    #[test]
    fn publish_bumps_version_and_snapshot_is_detached() {
        let shared = SharedTopology::new(Topology::new(1));
        assert_eq!(shared.version(), 0);
        shared.publish(|top| {
            top.set_partition_owner(0, Address::new(1, 6));
        });
        assert_eq!(shared.version(), 1);

        let snap = shared.snapshot();
        shared.publish(|top| {
            top.set_partition_owner(1, Address::new(2, 6));
        });
        // The earlier snapshot does not observe later publishes.
        assert_eq!(snap.num_partitions, 1);
        assert_eq!(shared.snapshot().num_partitions, 2);
    }
}
