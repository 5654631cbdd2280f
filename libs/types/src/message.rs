//! The message envelope and payload variants.
//!
//! A [`Message`] is the unit of transfer between actors: a
//! self-describing envelope (source and destination [`Address`]) plus
//! one of the payload variants below. Messages are owned values:
//! enqueueing moves ownership into the destination mailbox, dequeueing
//! moves it out to the consumer. Broadcast is the only place a message
//! is duplicated, via [`Message::broadcast_clone`].

use crate::address::{Address, NodeId};
use crate::errors::CodecError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Control-plane topic carried by a plain [`Signal`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topic {
    TopologyChange,
    Batch,
    SocketConnected,
    LoginRequest,
    Shutdown,
}

/// Plain signal: envelope plus a topic, no further data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub topic: Topic,
}

/// Hand-off of an accepted client socket from the listener to a
/// transaction agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketTransfer {
    pub sockfd: i32,
    pub events: u32,
}

/// Schema / user catalog change fanned out to every transaction agent
/// and engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaUpdate {
    pub userid: i64,
    pub domainid: i64,
    pub tableid: i64,
    pub ddl: String,
}

/// Deadlock-manager notification about a waits-for cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlockNotice {
    pub transactionid: i64,
    pub waitees: Vec<String>,
}

/// Command for the engine owning one partition, executed as part of a
/// distributed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtransactionCmd {
    pub subtransactionid: i64,
    pub tableid: i64,
    pub rowid: i64,
    pub row: Vec<u8>,
}

/// Transaction outcome broadcast to participating engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRollback {
    pub transactionid: i64,
    pub commit: bool,
}

/// One serialized message bound for a remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub nodeid: NodeId,
    pub bytes: Vec<u8>,
}

/// A batch of serialized messages accumulated by an outbound-gateway
/// producer, delivered to the gateway actor as a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedBatch {
    pub batch: Vec<BatchEntry>,
}

/// Tagged payload. Each variant owns its data outright, so the derived
/// `Clone` is the deep, per-kind copy broadcast needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Signal(Signal),
    Socket(SocketTransfer),
    Schema(SchemaUpdate),
    Deadlock(DeadlockNotice),
    Subtransaction(SubtransactionCmd),
    CommitRollback(CommitRollback),
    Batch(SerializedBatch),
}

/// Payload discriminant, used for logging and anomaly reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Signal,
    Socket,
    Schema,
    Deadlock,
    Subtransaction,
    CommitRollback,
    Batch,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Signal => "signal",
            PayloadKind::Socket => "socket",
            PayloadKind::Schema => "schema",
            PayloadKind::Deadlock => "deadlock",
            PayloadKind::Subtransaction => "subtransaction",
            PayloadKind::CommitRollback => "commit-rollback",
            PayloadKind::Batch => "batch",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source and destination of one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: Address,
    pub dest: Address,
}

/// The unit of inter-actor transfer: envelope plus variant payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub envelope: Envelope,
    pub payload: Payload,
}

impl Message {
    /// Create a message with an unset envelope. Routing fills the
    /// envelope in when the message is sent.
    pub fn new(payload: Payload) -> Self {
        Self {
            envelope: Envelope::default(),
            payload,
        }
    }

    pub fn set_envelope(&mut self, source: Address, dest: Address) {
        self.envelope = Envelope { source, dest };
    }

    pub fn kind(&self) -> PayloadKind {
        match &self.payload {
            Payload::Signal(_) => PayloadKind::Signal,
            Payload::Socket(_) => PayloadKind::Socket,
            Payload::Schema(_) => PayloadKind::Schema,
            Payload::Deadlock(_) => PayloadKind::Deadlock,
            Payload::Subtransaction(_) => PayloadKind::Subtransaction,
            Payload::CommitRollback(_) => PayloadKind::CommitRollback,
            Payload::Batch(_) => PayloadKind::Batch,
        }
    }

    /// Serialize the whole message (envelope included) for the
    /// cross-node batching path.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|source| CodecError::Encode {
            kind: self.kind().as_str(),
            source,
        })
    }

    /// Reconstruct a message from [`Message::encode`] output.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::Decode)
    }

    /// Deep copy for fan-out delivery. Every ordinary payload clones;
    /// an already-serialized batch is not a broadcastable payload and
    /// returns `None` (the caller logs the anomaly and skips that
    /// destination).
    pub fn broadcast_clone(&self) -> Option<Message> {
        match &self.payload {
            Payload::Batch(_) => None,
            _ => Some(self.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_msg() -> Message {
        Message::new(Payload::Schema(SchemaUpdate {
            userid: 7,
            domainid: 1,
            tableid: 42,
            ddl: "create table t (id bigint)".into(),
        }))
    }

    #[test]
    fn encode_decode_round_trip_preserves_envelope() {
        let mut msg = schema_msg();
        msg.set_envelope(Address::new(1, 5), Address::new(2, 6));

        let bytes = msg.encode().expect("encode");
        let back = Message::decode(&bytes).expect("decode");
        assert_eq!(back, msg);
        assert_eq!(back.envelope.dest, Address::new(2, 6));
    }

    #[test]
    fn broadcast_clone_is_deeply_owned() {
        let msg = schema_msg();
        let mut copy = msg.broadcast_clone().expect("clonable");
        if let Payload::Schema(update) = &mut copy.payload {
            update.ddl.push_str(" -- altered");
        }
        // The source payload is untouched by the mutation above.
        if let Payload::Schema(update) = &msg.payload {
            assert_eq!(update.ddl, "create table t (id bigint)");
        } else {
            unreachable!();
        }
    }

    #[test]
    fn batch_payload_refuses_broadcast_clone() {
        let msg = Message::new(Payload::Batch(SerializedBatch { batch: vec![] }));
        assert!(msg.broadcast_clone().is_none());
        assert_eq!(msg.kind(), PayloadKind::Batch);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Message::decode(&[0xff; 3]).is_err());
    }
}
