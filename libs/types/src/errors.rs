//! Error types for the message codec boundary.
//!
//! Routing anomalies (bad destination, out-of-range partition) are not
//! errors in the `Result` sense: the registry logs them and drops the
//! message, because stalling the whole mailbox over one bad route is
//! worse than losing that message. Only the codec boundary returns
//! `Result`.

use thiserror::Error;

/// Errors from encoding/decoding a [`Message`](crate::Message) for the
/// cross-node batching path.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload could not be serialized to bytes.
    #[error("encoding {kind} payload failed: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },

    /// Byte sequence did not decode to a valid message.
    #[error("decoding message failed: {0}")]
    Decode(#[source] bincode::Error),
}
