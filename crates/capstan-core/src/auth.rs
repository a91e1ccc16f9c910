//! Authentication credentials
//!
//! A closed set of credential variants rather than open-ended dynamic
//! dispatch: password and ed25519 key cover the client core; the
//! extension point for trust decisions is the `HostKeyVerifier` trait,
//! not the credential list.

use bytes::{Bytes, BytesMut};
use capstan_proto::wire;
use ed25519_dalek::{Signer, SigningKey};

/// Host-key and user-key algorithm name for ed25519
pub const SSH_ED25519: &str = "ssh-ed25519";

/// A credential to offer during user authentication
#[derive(Clone)]
pub enum Credential {
    /// Password authentication
    Password(String),
    /// Public-key authentication with an ed25519 private key
    Ed25519(SigningKey),
}

impl Credential {
    /// Authentication method name as advertised on the wire
    pub fn method_name(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::Ed25519(_) => "publickey",
        }
    }

    /// Public key blob in SSH wire format, for public-key credentials
    pub fn public_key_blob(&self) -> Option<Bytes> {
        match self {
            Credential::Password(_) => None,
            Credential::Ed25519(key) => {
                let mut blob = BytesMut::new();
                wire::put_str(&mut blob, SSH_ED25519);
                wire::put_string(&mut blob, key.verifying_key().as_bytes());
                Some(blob.freeze())
            }
        }
    }

    /// Sign `data` with the private key, producing an SSH signature blob
    pub fn sign(&self, data: &[u8]) -> Option<Bytes> {
        match self {
            Credential::Password(_) => None,
            Credential::Ed25519(key) => {
                let signature = key.sign(data);
                let mut blob = BytesMut::new();
                wire::put_str(&mut blob, SSH_ED25519);
                wire::put_string(&mut blob, &signature.to_bytes());
                Some(blob.freeze())
            }
        }
    }
}

// Secrets stay out of logs and error chains
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Credential::Password(..)"),
            Credential::Ed25519(_) => f.write_str("Credential::Ed25519(..)"),
        }
    }
}
