//! capstan-proto: SSH-2 binary packet protocol
//!
//! This crate defines the wire layer of the capstan client core: SSH
//! primitive encoding, the typed message registry with the registered
//! numeric codes, the binary packet codec (framing, aes128-ctr,
//! hmac-sha2-256, per-direction sequence numbers), and session key
//! derivation. It is symmetric: the client crate and the in-memory test
//! server both drive it, each installing its own direction keys.

pub mod codec;
pub mod error;
pub mod keys;
pub mod msg;
pub mod wire;

pub use codec::{PacketCodec, MAX_PACKET_SIZE};
pub use error::WireError;
pub use keys::{DirectionKeys, KeyMaterial};
pub use msg::{AuthMethod, ChannelRequestKind, KexInit, Message, MessageType};
