//! # Messaging Type Vocabulary
//!
//! Shared types for the inter-actor messaging substrate of the
//! partitioned database engine: logical addresses, the `Message`
//! envelope with its payload variants, and the byte codec used on the
//! cross-node batching path.
//!
//! This crate is deliberately free of concurrency. The lock-free
//! mailbox queue and the routing registry that move these messages
//! around live in `messaging-actors`.
//!
//! ## Addressing
//!
//! Every actor in the cluster is identified by an [`Address`]
//! (`{nodeid, actorid}`). Actor ids below [`FIRST_ACTORID`] are
//! reserved for the singleton roles of a node (topology manager,
//! deadlock manager, user-schema manager, listener); the rest are
//! dynamically assigned transaction-agent / engine / gateway instances.
//!
//! ## Wire contract
//!
//! Payloads cross node boundaries as opaque byte sequences produced by
//! [`Message::encode`] and consumed by [`Message::decode`]. The byte
//! layout is owned by the codec (bincode) and is not part of the
//! messaging core's design.

pub mod address;
pub mod errors;
pub mod message;

pub use address::{
    Address, NodeId, ACTORID_DEADLOCK_MGR, ACTORID_LISTENER, ACTORID_TOPOLOGY_MGR,
    ACTORID_USERSCHEMA_MGR, FIRST_ACTORID,
};
pub use errors::CodecError;
pub use message::{
    BatchEntry, CommitRollback, DeadlockNotice, Envelope, Message, Payload, PayloadKind,
    SchemaUpdate, SerializedBatch, Signal, SocketTransfer, SubtransactionCmd, Topic,
};
