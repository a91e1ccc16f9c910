//! capstan-client: SSH-2 session client
//!
//! Connects to an SSH server, negotiates an encrypted transport,
//! authenticates, and multiplexes interactive channels over the single
//! connection:
//!
//! ```no_run
//! use capstan_client::{ChannelEvent, Session};
//! use capstan_core::ConnectOptions;
//!
//! # async fn example() -> Result<(), capstan_core::Error> {
//! let options = ConnectOptions::new("host.example", "vista").password("secret");
//! let session = Session::connect(options).await?;
//!
//! let mut shell = session.open_shell().await?;
//! shell.write("echo hi\n").await?;
//! while let Some(event) = shell.recv().await {
//!     if let ChannelEvent::Data(data) = event {
//!         print!("{}", String::from_utf8_lossy(&data));
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Each session owns a worker task that drives the transport; `Session`
//! and `Channel` handles are cheap fronts over message channels into
//! it, so they can be used from any task.

pub mod auth;
pub mod mux;
pub mod session;
pub mod transport;

pub use session::{Channel, ChannelEvent, Session};
pub use transport::{Transport, TransportState, CLIENT_VERSION};

pub use capstan_core::{
    AcceptAll, ChannelId, ConnectOptions, Credential, Error, FingerprintPin, HostKeyVerifier,
    ServerHostKey,
};
