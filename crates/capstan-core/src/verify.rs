//! Host-key verification
//!
//! The trust boundary of the handshake: key exchange blocks until the
//! verifier answers, and a `false` fails the connection with
//! `HostKeyRejected` before any session keys are derived.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// The server's claimed identity key, as presented during key exchange
#[derive(Debug, Clone)]
pub struct ServerHostKey {
    /// Algorithm name, e.g. "ssh-ed25519"
    pub algorithm: String,
    /// Raw public key blob in SSH wire format
    pub blob: Bytes,
}

impl ServerHostKey {
    /// OpenSSH-style fingerprint: `SHA256:` plus unpadded base64
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }
}

/// Decides whether to trust the server's host key
///
/// Consulted exactly once per key exchange (including re-keys), after
/// the key's signature over the exchange hash has been checked.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    async fn verify(&self, host: &str, port: u16, key: &ServerHostKey) -> bool;
}

/// Accepts any host key. Only reasonable when a lower layer already
/// authenticates the peer (private network, pinned tunnel).
#[derive(Debug, Default)]
pub struct AcceptAll;

#[async_trait]
impl HostKeyVerifier for AcceptAll {
    async fn verify(&self, host: &str, port: u16, key: &ServerHostKey) -> bool {
        tracing::debug!(host, port, fingerprint = %key.fingerprint(), "accepting host key");
        true
    }
}

/// Accepts only a key whose fingerprint matches the pinned value
#[derive(Debug)]
pub struct FingerprintPin {
    expected: String,
}

impl FingerprintPin {
    /// Pin a fingerprint in `SHA256:...` form
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }
}

#[async_trait]
impl HostKeyVerifier for FingerprintPin {
    async fn verify(&self, host: &str, _port: u16, key: &ServerHostKey) -> bool {
        let fingerprint = key.fingerprint();
        if fingerprint == self.expected {
            true
        } else {
            tracing::warn!(
                host,
                expected = %self.expected,
                got = %fingerprint,
                "host key fingerprint mismatch"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> ServerHostKey {
        ServerHostKey {
            algorithm: "ssh-ed25519".into(),
            blob: Bytes::from_static(&[1, 2, 3, 4]),
        }
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = sample_key().fingerprint();
        assert!(fingerprint.starts_with("SHA256:"));
        // Unpadded base64 of a 32-byte digest is 43 characters
        assert_eq!(fingerprint.len(), "SHA256:".len() + 43);
        assert!(!fingerprint.ends_with('='));
    }

    #[tokio::test]
    async fn test_accept_all() {
        assert!(AcceptAll.verify("example.com", 22, &sample_key()).await);
    }

    #[tokio::test]
    async fn test_fingerprint_pin() {
        let key = sample_key();
        let pin = FingerprintPin::new(key.fingerprint());
        assert!(pin.verify("example.com", 22, &key).await);

        let wrong = FingerprintPin::new("SHA256:nope");
        assert!(!wrong.verify("example.com", 22, &key).await);
    }
}
