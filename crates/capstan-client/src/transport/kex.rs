//! Key exchange and algorithm negotiation
//!
//! One concrete suite is implemented end to end: curve25519-sha256 key
//! exchange, ssh-ed25519 host keys, aes128-ctr, hmac-sha2-256, no
//! compression. Negotiation itself is list-general; growing the suite
//! means adding a name to a list and a branch where it is used.

use std::sync::Arc;

use bytes::BytesMut;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

use capstan_core::{Error, HostKeyVerifier, ServerHostKey};
use capstan_proto::keys::KeyMaterial;
use capstan_proto::{wire, KexInit, Message};

use super::{Transport, TransportState};
use tokio::io::{AsyncRead, AsyncWrite};

pub const KEX_CURVE25519_SHA256: &str = "curve25519-sha256";
pub const HOST_KEY_ED25519: &str = "ssh-ed25519";
pub const CIPHER_AES128_CTR: &str = "aes128-ctr";
pub const MAC_HMAC_SHA2_256: &str = "hmac-sha2-256";
pub const COMPRESSION_NONE: &str = "none";

/// Algorithms selected for one key exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub kex: String,
    pub host_key: String,
    pub cipher_client_to_server: String,
    pub cipher_server_to_client: String,
    pub mac_client_to_server: String,
    pub mac_server_to_client: String,
    pub compression_client_to_server: String,
    pub compression_server_to_client: String,
}

/// Build the client's KEXINIT with a fresh random cookie
pub fn local_kexinit() -> KexInit {
    let mut cookie = [0u8; 16];
    OsRng.fill_bytes(&mut cookie);

    let one = |name: &str| vec![name.to_owned()];
    KexInit {
        cookie,
        kex_algorithms: one(KEX_CURVE25519_SHA256),
        server_host_key_algorithms: one(HOST_KEY_ED25519),
        encryption_client_to_server: one(CIPHER_AES128_CTR),
        encryption_server_to_client: one(CIPHER_AES128_CTR),
        mac_client_to_server: one(MAC_HMAC_SHA2_256),
        mac_server_to_client: one(MAC_HMAC_SHA2_256),
        compression_client_to_server: one(COMPRESSION_NONE),
        compression_server_to_client: one(COMPRESSION_NONE),
        languages_client_to_server: vec![],
        languages_server_to_client: vec![],
        first_kex_packet_follows: false,
    }
}

/// Pick the first local preference that the peer also supports
fn select_first(
    category: &'static str,
    ours: &[String],
    theirs: &[String],
) -> Result<String, Error> {
    ours.iter()
        .find(|name| theirs.contains(name))
        .cloned()
        .ok_or(Error::NoCommonAlgorithm { category })
}

/// Intersect algorithm lists by local preference order
pub fn negotiate(ours: &KexInit, theirs: &KexInit) -> Result<Negotiated, Error> {
    Ok(Negotiated {
        kex: select_first("key exchange", &ours.kex_algorithms, &theirs.kex_algorithms)?,
        host_key: select_first(
            "host key",
            &ours.server_host_key_algorithms,
            &theirs.server_host_key_algorithms,
        )?,
        cipher_client_to_server: select_first(
            "cipher",
            &ours.encryption_client_to_server,
            &theirs.encryption_client_to_server,
        )?,
        cipher_server_to_client: select_first(
            "cipher",
            &ours.encryption_server_to_client,
            &theirs.encryption_server_to_client,
        )?,
        mac_client_to_server: select_first(
            "MAC",
            &ours.mac_client_to_server,
            &theirs.mac_client_to_server,
        )?,
        mac_server_to_client: select_first(
            "MAC",
            &ours.mac_server_to_client,
            &theirs.mac_server_to_client,
        )?,
        compression_client_to_server: select_first(
            "compression",
            &ours.compression_client_to_server,
            &theirs.compression_client_to_server,
        )?,
        compression_server_to_client: select_first(
            "compression",
            &ours.compression_server_to_client,
            &theirs.compression_server_to_client,
        )?,
    })
}

/// Exchange hash H (RFC 5656 §4 with curve25519-sha256 inputs)
pub fn exchange_hash(
    client_version: &str,
    server_version: &str,
    client_kexinit_payload: &[u8],
    server_kexinit_payload: &[u8],
    host_key_blob: &[u8],
    client_public: &[u8],
    server_public: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::put_str(&mut buf, client_version);
    wire::put_str(&mut buf, server_version);
    wire::put_string(&mut buf, client_kexinit_payload);
    wire::put_string(&mut buf, server_kexinit_payload);
    wire::put_string(&mut buf, host_key_blob);
    wire::put_string(&mut buf, client_public);
    wire::put_string(&mut buf, server_public);
    wire::put_mpint(&mut buf, shared_secret);
    Sha256::digest(&buf).to_vec()
}

fn parse_ed25519_host_key(blob: &[u8]) -> Result<VerifyingKey, Error> {
    let mut src = bytes::Bytes::copy_from_slice(blob);
    let algorithm = wire::get_str(&mut src).map_err(Error::from)?;
    if algorithm != HOST_KEY_ED25519 {
        return Err(Error::ProtocolViolation(format!(
            "host key algorithm mismatch: {algorithm}"
        )));
    }
    let key = wire::get_string(&mut src).map_err(Error::from)?;
    let key: [u8; 32] = key
        .as_ref()
        .try_into()
        .map_err(|_| Error::ProtocolViolation("bad ed25519 host key length".into()))?;
    VerifyingKey::from_bytes(&key)
        .map_err(|_| Error::ProtocolViolation("invalid ed25519 host key".into()))
}

fn parse_ed25519_signature(blob: &[u8]) -> Result<Signature, Error> {
    let mut src = bytes::Bytes::copy_from_slice(blob);
    let algorithm = wire::get_str(&mut src).map_err(Error::from)?;
    if algorithm != HOST_KEY_ED25519 {
        return Err(Error::ProtocolViolation(format!(
            "signature algorithm mismatch: {algorithm}"
        )));
    }
    let raw = wire::get_string(&mut src).map_err(Error::from)?;
    Signature::from_slice(&raw)
        .map_err(|_| Error::ProtocolViolation("bad ed25519 signature length".into()))
}

/// Whether a message may arrive while we wait for the peer's KEXINIT
/// during a client-initiated re-key (connection-layer traffic already
/// in flight on the peer's side)
fn may_interleave(message: &Message) -> bool {
    message.message_type().as_u8() >= 80
}

/// Run one key exchange to completion
///
/// `peer_init` carries the peer's KEXINIT when the peer initiated the
/// re-key; `None` means we send first and wait for theirs. Returns
/// connection-layer messages that arrived while waiting, for the caller
/// to process once keys are live.
pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut Transport<S>,
    host: &str,
    port: u16,
    verifier: &Arc<dyn HostKeyVerifier>,
    peer_init: Option<KexInit>,
) -> Result<Vec<Message>, Error> {
    let rekeying = transport.state() == TransportState::KeysEstablished;
    transport.set_state(if rekeying {
        TransportState::ReKeying
    } else {
        TransportState::KexInProgress
    });

    let ours = local_kexinit();
    let client_kexinit_payload = Message::KexInit(ours.clone()).to_payload();
    transport.send(Message::KexInit(ours.clone())).await?;

    let mut deferred = Vec::new();
    let theirs = match peer_init {
        Some(init) => init,
        None => loop {
            match transport.recv().await? {
                Message::KexInit(init) => break init,
                other if rekeying && may_interleave(&other) => deferred.push(other),
                other => {
                    transport.set_state(TransportState::Closed);
                    return Err(Error::ProtocolViolation(format!(
                        "expected KEXINIT, got {:?}",
                        other.message_type()
                    )));
                }
            }
        },
    };
    let server_kexinit_payload = Message::KexInit(theirs.clone()).to_payload();

    let negotiated = negotiate(&ours, &theirs)?;
    tracing::debug!(
        kex = %negotiated.kex,
        host_key = %negotiated.host_key,
        cipher = %negotiated.cipher_client_to_server,
        mac = %negotiated.mac_client_to_server,
        rekeying,
        "algorithms negotiated"
    );

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let client_public = PublicKey::from(&ephemeral);
    transport
        .send(Message::KexEcdhInit {
            client_public: bytes::Bytes::copy_from_slice(client_public.as_bytes()),
        })
        .await?;

    let (host_key_blob, server_public, signature_blob) = match transport.recv().await? {
        Message::KexEcdhReply {
            host_key_blob,
            server_public,
            signature_blob,
        } => (host_key_blob, server_public, signature_blob),
        other => {
            transport.set_state(TransportState::Closed);
            return Err(Error::ProtocolViolation(format!(
                "expected KEX_ECDH_REPLY, got {:?}",
                other.message_type()
            )));
        }
    };

    let server_public_bytes: [u8; 32] = server_public
        .as_ref()
        .try_into()
        .map_err(|_| Error::ProtocolViolation("bad curve25519 public key length".into()))?;
    let shared = ephemeral.diffie_hellman(&PublicKey::from(server_public_bytes));
    if !shared.was_contributory() {
        transport.set_state(TransportState::Closed);
        return Err(Error::ProtocolViolation(
            "degenerate curve25519 shared secret".into(),
        ));
    }

    let hash = exchange_hash(
        transport.local_version(),
        transport.peer_version(),
        &client_kexinit_payload,
        &server_kexinit_payload,
        &host_key_blob,
        client_public.as_bytes(),
        &server_public,
        shared.as_bytes(),
    );

    let verifying_key = parse_ed25519_host_key(&host_key_blob)?;
    let signature = parse_ed25519_signature(&signature_blob)?;
    if verifying_key.verify(&hash, &signature).is_err() {
        transport.set_state(TransportState::Closed);
        return Err(Error::ProtocolViolation(
            "host key signature does not verify".into(),
        ));
    }

    // The trust boundary: nothing proceeds until the verifier answers
    let server_host_key = ServerHostKey {
        algorithm: negotiated.host_key.clone(),
        blob: host_key_blob.clone(),
    };
    if !verifier.verify(host, port, &server_host_key).await {
        transport.set_state(TransportState::Closed);
        return Err(Error::HostKeyRejected);
    }

    let session_id = transport
        .session_id()
        .map(<[u8]>::to_vec)
        .unwrap_or_else(|| hash.clone());
    let keys = KeyMaterial::derive(shared.as_bytes(), &hash, &session_id);

    transport.send(Message::NewKeys).await?;
    transport.codec_mut().install_outbound(&keys.client_to_server);

    match transport.recv().await? {
        Message::NewKeys => {}
        other => {
            transport.set_state(TransportState::Closed);
            return Err(Error::ProtocolViolation(format!(
                "expected NEWKEYS, got {:?}",
                other.message_type()
            )));
        }
    }
    transport.codec_mut().install_inbound(&keys.server_to_client);

    transport.set_session_id(session_id);
    transport.set_state(TransportState::KeysEstablished);
    tracing::debug!(rekeying, "keys established");

    Ok(deferred)
}
