//! # Inter-Actor Messaging Core
//!
//! The messaging substrate of the partitioned database engine. Every
//! engine component (transaction agents, storage engines, the
//! topology manager, gateways) is an actor on its own OS thread that
//! communicates exclusively by passing owned [`Message`](types::Message)
//! values; there is no shared mutable state between actors.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   to_actor / to_partition    ┌───────────────────┐
//! │ sending      │ ───────────────────────────> │ Mboxes (registry) │
//! │ actor thread │                              │  addr -> producer │
//! └──────────────┘                              └─────────┬─────────┘
//!                                      local    ┌─────────┴─────────┐   remote
//!                             ┌─────────────────┤   MboxProducer    ├──────────────┐
//!                             v                 └───────────────────┘              v
//!                  ┌────────────────────┐                              ┌─────────────────────┐
//!                  │ Mbox (lock-free    │                              │ outbound batch      │
//!                  │ MPSC queue)        │                              │ {node, bytes} pairs │
//!                  └─────────┬──────────┘                              └──────────┬──────────┘
//!                            v  recv (single consumer)                            v  flush
//!                  ┌────────────────────┐                              ┌─────────────────────┐
//!                  │ owning actor       │                              │ outbound gateway    │
//!                  │ thread             │                              │ mailbox (local)     │
//!                  └────────────────────┘                              └─────────────────────┘
//! ```
//!
//! Guarantees: a single producer's messages to one destination arrive
//! in program order; every enqueued message is delivered exactly once;
//! enqueue never blocks the caller. There is no cross-producer
//! ordering, no persistence, no delivery acknowledgment and no retry;
//! failure policy for those belongs to the calling actors.

pub mod mbox;
pub mod producer;
pub mod registry;
pub mod topology;

pub use mbox::{Mbox, MboxConsumer, Timeout};
pub use producer::{MboxProducer, OB_BATCH_CAPACITY};
pub use registry::{Location, Mboxes};
pub use topology::{ActorEntry, ActorType, SharedTopology, Topology};
