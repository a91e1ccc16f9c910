//! Error taxonomy for the capstan client
//!
//! Fatal connection-level failures, the recoverable authentication
//! outcome, and channel-local failures are distinct variants so callers
//! can tell which scope an error killed. The library never retries
//! internally; reconnect policy belongs to the caller.

use capstan_proto::WireError;
use thiserror::Error;

/// Top-level error type for the capstan client
#[derive(Error, Debug)]
pub enum Error {
    /// Socket-level failure before the connection was established
    /// (DNS, refused, connect timeout)
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Malformed or unexpected message; the connection is torn down
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Algorithm negotiation found no common entry for a category
    #[error("No common {category} algorithm with peer")]
    NoCommonAlgorithm { category: &'static str },

    /// The host-key verifier declined the server's key; no session keys
    /// were derived
    #[error("Host key rejected by verifier")]
    HostKeyRejected,

    /// MAC or decryption failure; treated as tampering, never retried
    #[error("Packet integrity check failed")]
    Integrity,

    /// Every supplied credential was rejected. Carries the server's
    /// last-advertised authentication methods for diagnostics.
    #[error("Authentication exhausted; server accepts: {}", remaining_methods.join(","))]
    AuthExhausted { remaining_methods: Vec<String> },

    /// The server refused a channel open; other channels are unaffected
    #[error("Channel open rejected (reason {reason_code}): {description}")]
    ChannelOpenRejected {
        reason_code: u32,
        description: String,
    },

    /// The connection is gone; surfaced to every pending operation
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error on the established connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::MacMismatch => Error::Integrity,
            WireError::Io(io) => Error::Io(io),
            other => Error::ProtocolViolation(other.to_string()),
        }
    }
}
