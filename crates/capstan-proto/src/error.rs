//! Wire-level error types

use thiserror::Error;

/// Errors that can occur while framing or parsing protocol bytes
#[derive(Error, Debug)]
pub enum WireError {
    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Packet exceeds the maximum accepted size
    #[error("Packet too large: {size} bytes exceeds maximum of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },

    /// Packet length or padding fields are inconsistent
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A message payload ended before a required field
    #[error("Truncated message payload")]
    Truncated,

    /// A protocol string field was not valid UTF-8
    #[error("Invalid UTF-8 in protocol string")]
    BadUtf8,

    /// MAC verification failed on an inbound packet
    #[error("MAC verification failed")]
    MacMismatch,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
