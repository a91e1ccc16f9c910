//! Connection options
//!
//! Plain option structs with defaults; loading these from files or
//! command lines is the caller's business, not the library's.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::Credential;
use crate::verify::{AcceptAll, HostKeyVerifier};

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Default timeout for TCP establishment
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout covering banner exchange, key exchange, and
/// authentication together
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for establishing a session
#[derive(Clone)]
pub struct ConnectOptions {
    /// Hostname or address to connect to
    pub host: String,
    /// TCP port (default 22)
    pub port: u16,
    /// Username to authenticate as
    pub username: String,
    /// Credentials, tried in order; each is attempted at most once
    pub credentials: Vec<Credential>,
    /// Timeout for TCP establishment
    pub connect_timeout: Duration,
    /// Timeout for the overall handshake (version exchange through
    /// authentication); expiry tears down the socket
    pub handshake_timeout: Duration,
    /// Host-key trust decision. Defaults to `AcceptAll`; pin a
    /// fingerprint for anything that crosses a network you don't own.
    pub verifier: Arc<dyn HostKeyVerifier>,
}

impl ConnectOptions {
    /// Options for `host:22` with no credentials and default timeouts
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            credentials: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            verifier: Arc::new(AcceptAll),
        }
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Append a password credential
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.credentials.push(Credential::Password(password.into()));
        self
    }

    /// Append a credential
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credentials.push(credential);
        self
    }

    /// Set the TCP connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the overall handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the host-key verifier
    pub fn verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// `host:port` string for connecting and logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("credentials", &self.credentials.len())
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}
