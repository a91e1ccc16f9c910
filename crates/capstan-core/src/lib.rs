//! capstan-core: Core abstractions for the capstan SSH client
//!
//! This crate provides the shared error taxonomy, connection options,
//! credential types, and the host-key verification trait used by the
//! client crate.

pub mod auth;
pub mod error;
pub mod options;
pub mod types;
pub mod verify;

pub use auth::Credential;
pub use error::Error;
pub use options::ConnectOptions;
pub use types::ChannelId;
pub use verify::{AcceptAll, FingerprintPin, HostKeyVerifier, ServerHostKey};
