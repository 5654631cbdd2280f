//! Mailbox producer: the enqueue-side handle bound to one mailbox.
//!
//! A producer either delivers locally (the bound destination lives on
//! this node: ownership of the message moves straight into the mailbox
//! via the lock-free append) or batches for the wire (the destination
//! node differs: the message is serialized, paired with its node id,
//! and accumulated until the batch is flushed to the outbound gateway).
//!
//! In practice only the producer bound to the outbound-gateway actor
//! ever sees remote destinations (the registry routes every
//! cross-node send through it), so the batch buffer sits idle on all
//! other producers.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};
use types::{Address, BatchEntry, Message, NodeId, Payload, SerializedBatch};

use crate::mbox::Mbox;

/// Default outbound batch capacity: a full batch triggers an immediate
/// flush; anything short of it waits for the owning actor's idle-flush
/// policy.
pub const OB_BATCH_CAPACITY: usize = 5000;

/// Enqueue handle bound to exactly one destination mailbox.
pub struct MboxProducer {
    mbox: Arc<Mbox>,
    /// Node this producer delivers for; a message whose destination
    /// node differs is a cross-node hop and goes through the batch.
    nodeid: NodeId,
    /// Outbound batch: `{destination node, serialized bytes}` pairs.
    /// Only the remote path touches this lock; local sends stay
    /// lock-free.
    batch: Mutex<Vec<BatchEntry>>,
    batch_capacity: usize,
}

impl MboxProducer {
    pub fn new(mbox: Arc<Mbox>, nodeid: NodeId) -> Self {
        Self::with_batch_capacity(mbox, nodeid, OB_BATCH_CAPACITY)
    }

    pub fn with_batch_capacity(mbox: Arc<Mbox>, nodeid: NodeId, batch_capacity: usize) -> Self {
        Self {
            mbox,
            nodeid,
            batch: Mutex::new(Vec::new()),
            batch_capacity,
        }
    }

    pub fn nodeid(&self) -> NodeId {
        self.nodeid
    }

    /// Send an owned message. Local destinations are appended to the
    /// bound mailbox and the call returns with delivery guaranteed.
    /// Remote destinations are serialized into the outbound batch; the
    /// in-memory message is released once its bytes are captured. A
    /// batch that reaches capacity is flushed immediately.
    pub fn send(&self, msg: Message) {
        if msg.envelope.dest.nodeid != self.nodeid {
            // Cross-node hop: capture bytes, drop the object.
            let bytes = match msg.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(
                        dest = %msg.envelope.dest,
                        kind = %msg.kind(),
                        %err,
                        "dropping unserializable cross-node message"
                    );
                    return;
                }
            };
            let full = {
                let mut batch = self.batch.lock();
                batch.push(BatchEntry {
                    nodeid: msg.envelope.dest.nodeid,
                    bytes,
                });
                batch.len() >= self.batch_capacity
            };
            if full {
                self.flush();
            }
            return;
        }
        self.mbox.push(msg);
    }

    /// Package any accumulated batch as a single serialized-batch
    /// message and enqueue it into the bound mailbox (the outbound
    /// gateway's inbox) via the ordinary local path. Leaves the batch
    /// buffer empty. No-op when nothing is pending.
    pub fn flush(&self) {
        let entries = {
            let mut batch = self.batch.lock();
            if batch.is_empty() {
                return;
            }
            std::mem::take(&mut *batch)
        };
        trace!(nodeid = self.nodeid, entries = entries.len(), "flushing outbound batch");
        let mut msg = Message::new(Payload::Batch(SerializedBatch { batch: entries }));
        // The batch itself is a local delivery to the gateway actor.
        let here = Address::new(self.nodeid, 0);
        msg.set_envelope(here, here);
        self.mbox.push(msg);
    }

    /// Whether serialized messages are waiting for a flush. Drives the
    /// calling actor's timer/idle-flush policy.
    pub fn has_pending_batch(&self) -> bool {
        !self.batch.lock().is_empty()
    }
}

impl std::fmt::Debug for MboxProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MboxProducer")
            .field("nodeid", &self.nodeid)
            .field("batch_capacity", &self.batch_capacity)
            .finish()
    }
}
