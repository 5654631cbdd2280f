//! Per-node mailbox registry: logical address -> producer resolution.
//!
//! Every actor owns one [`Mboxes`] and routes all of its sends through
//! it. The registry resolves an actor id, partition id, named
//! singleton role, or actor-type broadcast to concrete
//! [`MboxProducer`] handles, and rebuilds that resolution additively
//! whenever the actor refreshes its topology snapshot: slots already
//! resolved are never replaced, because their producers may be
//! referenced by in-flight sends.
//!
//! Routing anomalies (unresolved destination, out-of-range partition,
//! unbroadcastable payload) are logged and the message dropped; the
//! registry stays usable. Losing one badly routed message is
//! preferable to stalling the mailbox behind it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};
use types::{
    Address, Message, NodeId, ACTORID_DEADLOCK_MGR, ACTORID_USERSCHEMA_MGR, FIRST_ACTORID,
};

use crate::producer::{MboxProducer, OB_BATCH_CAPACITY};
use crate::topology::{ActorType, SharedTopology};

/// Resolved address + producer for one destination (a singleton role
/// or a partition owner).
#[derive(Debug, Clone, Default)]
pub struct Location {
    pub address: Address,
    pub producer: Option<Arc<MboxProducer>>,
}

/// One actor's routing table over the whole cluster.
pub struct Mboxes {
    nodeid: NodeId,
    batch_capacity: usize,
    /// Version of the last applied topology snapshot; rebuilds are
    /// skipped while it is unchanged.
    topology_version: Option<u64>,

    /// Local actor id -> producer.
    actorid_to_producers: Vec<Option<Arc<MboxProducer>>>,
    /// Transaction-agent instance -> producer.
    transaction_agents: Vec<Option<Arc<MboxProducer>>>,
    /// Engine instance -> producer.
    engines: Vec<Option<Arc<MboxProducer>>>,

    topology_mgr: Option<Arc<MboxProducer>>,
    listener: Option<Arc<MboxProducer>>,
    userschema_mgr: Location,
    deadlock_mgr: Location,
    /// This actor's outbound gateway (one of the node's gateway
    /// instances, chosen deterministically in `update`).
    ob_gateway: Option<Arc<MboxProducer>>,

    /// Partition id -> owning address and producer (local producer, or
    /// the outbound gateway for remote owners).
    partition_to_producers: Vec<Location>,

    /// `[nodeid][actorid]` -> actor type, cluster-wide.
    all_actors: Vec<Vec<ActorType>>,
    /// The grid restricted to this replica.
    all_actors_this_replica: HashMap<NodeId, Vec<ActorType>>,
}

impl Mboxes {
    pub fn new(nodeid: NodeId) -> Self {
        Self::with_batch_capacity(nodeid, OB_BATCH_CAPACITY)
    }

    /// Registry whose producers flush their outbound batch at
    /// `batch_capacity` entries instead of the default.
    pub fn with_batch_capacity(nodeid: NodeId, batch_capacity: usize) -> Self {
        Self {
            nodeid,
            batch_capacity,
            topology_version: None,
            actorid_to_producers: Vec::new(),
            transaction_agents: Vec::new(),
            engines: Vec::new(),
            topology_mgr: None,
            listener: None,
            userschema_mgr: Location::default(),
            deadlock_mgr: Location::default(),
            ob_gateway: None,
            partition_to_producers: Vec::new(),
            all_actors: Vec::new(),
            all_actors_this_replica: HashMap::new(),
        }
    }

    pub fn nodeid(&self) -> NodeId {
        self.nodeid
    }

    /// Recompute routing tables from the authoritative topology.
    ///
    /// Additive and idempotent: producers already resolved keep their
    /// identity, only missing slots are filled in. The shared lock is
    /// held just long enough to copy the snapshot. `my_actorid` is the
    /// calling actor's own id, used to pick which outbound-gateway
    /// instance serves this actor.
    pub fn update(&mut self, shared: &SharedTopology, my_actorid: i16) {
        let top = shared.snapshot();
        if self.topology_version == Some(top.version) {
            return;
        }
        debug!(
            nodeid = self.nodeid,
            version = top.version,
            actors = top.actor_list.len(),
            partitions = top.num_partitions,
            "rebuilding mailbox registry"
        );

        if self.actorid_to_producers.len() < top.actor_list.len() {
            self.actorid_to_producers.resize(top.actor_list.len(), None);
        }
        if self.transaction_agents.len() < top.num_transaction_agents {
            self.transaction_agents.resize(top.num_transaction_agents, None);
        }
        if self.engines.len() < top.num_engines {
            self.engines.resize(top.num_engines, None);
        }

        for n in 1..top.actor_list.len() {
            if self.actorid_to_producers[n].is_some() {
                continue;
            }
            let entry = &top.actor_list[n];
            let producer = entry.mbox.as_ref().map(|mbox| {
                Arc::new(MboxProducer::with_batch_capacity(
                    Arc::clone(mbox),
                    top.nodeid,
                    self.batch_capacity,
                ))
            });
            self.actorid_to_producers[n] = producer.clone();

            match entry.actortype {
                ActorType::TransactionAgent => {
                    match self.transaction_agents.get_mut(entry.instance as usize) {
                        Some(slot) => *slot = producer,
                        None => warn!(
                            actorid = n,
                            instance = entry.instance,
                            "transaction-agent instance outside declared count"
                        ),
                    }
                }
                ActorType::Engine => {
                    match self.engines.get_mut(entry.instance as usize) {
                        Some(slot) => *slot = producer,
                        None => warn!(
                            actorid = n,
                            instance = entry.instance,
                            "engine instance outside declared count"
                        ),
                    }
                }
                ActorType::TopologyMgr => {
                    self.topology_mgr = producer;
                }
                ActorType::Listener => {
                    self.listener = producer;
                }
                ActorType::UserSchemaMgr => {
                    self.userschema_mgr = Location {
                        address: Address::new(top.nodeid, n as i16),
                        producer,
                    };
                }
                ActorType::DeadlockMgr => {
                    self.deadlock_mgr = Location {
                        address: Address::new(top.nodeid, n as i16),
                        producer,
                    };
                }
                ActorType::ObGateway => {
                    // Gateway instances are partitioned across calling
                    // actors; only this actor's share becomes its
                    // outbound gateway.
                    if top.num_obgateways > 0
                        && (my_actorid as usize) % top.num_obgateways
                            == entry.instance as usize
                    {
                        self.ob_gateway = producer;
                    }
                }
                ActorType::IbGateway | ActorType::None => {}
            }
        }

        // The owner list normally matches num_partitions, but both
        // Topology fields are writable; size the table to whichever is
        // larger so a mismatched snapshot cannot index past the end.
        let partitions = top.num_partitions.max(top.partition_list_this_replica.len());
        if self.partition_to_producers.len() < partitions {
            self.partition_to_producers
                .resize(partitions, Location::default());
        }
        for n in 0..top.partition_list_this_replica.len() {
            if self.partition_to_producers[n].address.is_resolved() {
                continue;
            }
            let address = top.partition_list_this_replica[n];
            let producer = if address.nodeid == top.nodeid {
                self.actorid_to_producers
                    .get(address.actorid as usize)
                    .cloned()
                    .flatten()
            } else {
                self.ob_gateway.clone()
            };
            self.partition_to_producers[n] = Location { address, producer };
        }

        self.all_actors = top.all_actors.clone();
        self.all_actors_this_replica = top.all_actors_this_replica.clone();

        // Singleton roles hosted on another node route by address.
        if top.userschema_mgr_node != 0 && top.userschema_mgr_node != top.nodeid {
            self.userschema_mgr.address =
                Address::new(top.userschema_mgr_node, ACTORID_USERSCHEMA_MGR);
        }
        if top.deadlock_mgr_node != 0 && top.deadlock_mgr_node != top.nodeid {
            self.deadlock_mgr.address =
                Address::new(top.deadlock_mgr_node, ACTORID_DEADLOCK_MGR);
        }

        self.topology_version = Some(top.version);
    }

    /// Send by explicit actor address. Local destinations enqueue
    /// directly; anything else goes to the outbound gateway.
    pub fn to_actor(&self, source: Address, dest: Address, mut msg: Message) {
        msg.set_envelope(source, dest);
        if dest.nodeid == self.nodeid {
            let producer = usize::try_from(dest.actorid)
                .ok()
                .and_then(|id| self.actorid_to_producers.get(id))
                .and_then(|slot| slot.as_ref());
            match producer {
                Some(producer) => producer.send(msg),
                None => warn!(
                    %dest,
                    kind = %msg.kind(),
                    "no producer resolved for destination actor; dropping message"
                ),
            }
        } else {
            match &self.ob_gateway {
                Some(gateway) => gateway.send(msg),
                None => warn!(
                    %dest,
                    kind = %msg.kind(),
                    "no outbound gateway resolved; dropping cross-node message"
                ),
            }
        }
    }

    /// Send to the replica's user-schema manager.
    pub fn to_user_schema_mgr(&self, source: Address, msg: Message) {
        if !self.userschema_mgr.address.is_resolved() {
            warn!(kind = %msg.kind(), "user-schema manager unresolved; dropping message");
            return;
        }
        self.to_actor(source, self.userschema_mgr.address, msg);
    }

    /// Send to the replica's deadlock manager.
    pub fn to_deadlock_mgr(&self, source: Address, msg: Message) {
        if !self.deadlock_mgr.address.is_resolved() {
            warn!(kind = %msg.kind(), "deadlock manager unresolved; dropping message");
            return;
        }
        self.to_actor(source, self.deadlock_mgr.address, msg);
    }

    /// Send to the engine owning `partitionid`. An id outside the
    /// resolved partition table is a routing anomaly: logged, message
    /// dropped, registry unharmed.
    pub fn to_partition(&self, source: Address, partitionid: i64, mut msg: Message) {
        let location = usize::try_from(partitionid)
            .ok()
            .and_then(|id| self.partition_to_producers.get(id));
        let Some(location) = location else {
            warn!(
                partitionid,
                partitions = self.partition_to_producers.len(),
                kind = %msg.kind(),
                "partition id out of range; dropping message"
            );
            return;
        };
        let Some(producer) = &location.producer else {
            warn!(
                partitionid,
                owner = %location.address,
                kind = %msg.kind(),
                "partition owner unresolved; dropping message"
            );
            return;
        };
        msg.set_envelope(source, location.address);
        producer.send(msg);
    }

    /// Deliver an independent deep copy of `msg` to every actor of
    /// `actortype` in the cluster. Returns the number of destinations
    /// matched. A payload that refuses cloning is logged and skipped
    /// for that destination without aborting the broadcast.
    pub fn to_all_of_type(&self, actortype: ActorType, source: Address, msg: &Message) -> i64 {
        let mut tally = 0;
        for n in 1..self.all_actors.len() {
            tally += self.broadcast_row(actortype, source, msg, n as NodeId, &self.all_actors[n]);
        }
        tally
    }

    /// [`to_all_of_type`](Self::to_all_of_type) restricted to the
    /// local replica's nodes.
    pub fn to_all_of_type_this_replica(
        &self,
        actortype: ActorType,
        source: Address,
        msg: &Message,
    ) -> i64 {
        let mut tally = 0;
        for (&nodeid, row) in &self.all_actors_this_replica {
            tally += self.broadcast_row(actortype, source, msg, nodeid, row);
        }
        tally
    }

    fn broadcast_row(
        &self,
        actortype: ActorType,
        source: Address,
        msg: &Message,
        nodeid: NodeId,
        row: &[ActorType],
    ) -> i64 {
        let mut tally = 0;
        for m in (FIRST_ACTORID as usize)..row.len() {
            if row[m] != actortype {
                continue;
            }
            match msg.broadcast_clone() {
                Some(clone) => self.to_actor(source, Address::new(nodeid, m as i16), clone),
                None => warn!(
                    kind = %msg.kind(),
                    dest = %Address::new(nodeid, m as i16),
                    "payload kind is not broadcastable; skipping destination"
                ),
            }
            tally += 1;
        }
        tally
    }

    /// Flush this actor's outbound gateway batch, if any data is
    /// pending. No-op when no gateway is resolved.
    pub fn send_ob_batch(&self) {
        if let Some(gateway) = &self.ob_gateway {
            gateway.flush();
        }
    }

    /// Resolved producer for a local actor id, if any.
    pub fn actor_producer(&self, actorid: i16) -> Option<Arc<MboxProducer>> {
        usize::try_from(actorid)
            .ok()
            .and_then(|id| self.actorid_to_producers.get(id))
            .cloned()
            .flatten()
    }

    /// Resolved producer for a transaction-agent instance.
    pub fn transaction_agent(&self, instance: usize) -> Option<Arc<MboxProducer>> {
        self.transaction_agents.get(instance).cloned().flatten()
    }

    /// Resolved producer for an engine instance.
    pub fn engine(&self, instance: usize) -> Option<Arc<MboxProducer>> {
        self.engines.get(instance).cloned().flatten()
    }

    /// This actor's outbound-gateway producer.
    pub fn ob_gateway(&self) -> Option<Arc<MboxProducer>> {
        self.ob_gateway.clone()
    }

    /// The node's topology-manager producer.
    pub fn topology_mgr(&self) -> Option<Arc<MboxProducer>> {
        self.topology_mgr.clone()
    }

    /// The node's listener producer.
    pub fn listener(&self) -> Option<Arc<MboxProducer>> {
        self.listener.clone()
    }

    /// Owner location for a partition id, if resolved.
    pub fn partition_location(&self, partitionid: usize) -> Option<&Location> {
        self.partition_to_producers.get(partitionid)
    }
}

impl std::fmt::Debug for Mboxes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mboxes")
            .field("nodeid", &self.nodeid)
            .field("topology_version", &self.topology_version)
            .field("actors", &self.actorid_to_producers.len())
            .field("partitions", &self.partition_to_producers.len())
            .finish()
    }
}
