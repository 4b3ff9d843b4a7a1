//! Engine error taxonomy
//!
//! Server rejections are not errors; they arrive as `error` envelopes and
//! surface as session notices. The types here cover the engine's own
//! fallible edges: the wire codec, the transport handle, the identity
//! store and the REST directory.

use thiserror::Error;

/// Failures decoding inbound envelopes or encoding outgoing intents.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope kind not present in this build's protocol surface.
    /// Logged and dropped at dispatch, never fatal.
    #[error("unknown envelope kind `{kind}`")]
    UnknownKind { kind: String },

    /// Envelope failed to decode (bad JSON or bad payload shape).
    #[error("malformed envelope (kind {kind:?}): {source}")]
    Malformed {
        kind: Option<String>,
        #[source]
        source: serde_json::Error,
    },

    /// An outgoing intent failed to serialize.
    #[error("intent encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Failures at the transport handle. The background client thread keeps
/// its own reconnection state; these only cover the handle side.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send queue is full")]
    QueueFull,
    #[error("client is shut down")]
    Closed,
}

/// Failures persisting or clearing identity records.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Failures talking to the REST race directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("race directory request failed: {0}")]
    Http(String),
    #[error("race directory returned status {0}")]
    Status(u16),
    #[error("race directory payload: {0}")]
    Payload(String),
}
