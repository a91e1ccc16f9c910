//! Scripted in-memory SSH server for integration tests
//!
//! Speaks the real wire protocol over a duplex pipe by driving the
//! packet codec from the server side: genuine key exchange, genuine
//! encryption, scripted authentication and channel behavior. Tests
//! spawn one of these and script each phase explicitly, so every
//! assertion runs against bytes that crossed the (in-memory) wire.

use bytes::{Bytes, BytesMut};
use ed25519_dalek::{Signer, SigningKey};
use futures::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::{Framed, FramedParts};
use x25519_dalek::{EphemeralSecret, PublicKey};

use capstan_client::transport::kex;
use capstan_proto::keys::KeyMaterial;
use capstan_proto::{wire, AuthMethod, ChannelRequestKind, Message, PacketCodec};

pub const SERVER_VERSION: &str = "SSH-2.0-scripted_0.1";

/// Server-assigned id for the first (and only) channel in each script
pub const SERVER_CHANNEL_ID: u32 = 99;

pub fn host_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Wire encoding of an ssh-ed25519 public host key
pub fn host_key_blob(key: &SigningKey) -> Bytes {
    let mut blob = BytesMut::new();
    wire::put_str(&mut blob, "ssh-ed25519");
    wire::put_string(&mut blob, key.verifying_key().as_bytes());
    blob.freeze()
}

pub struct TestServer {
    framed: Framed<DuplexStream, PacketCodec>,
    client_version: String,
    pub session_id: Vec<u8>,
}

/// Server side of one ECDH exchange plus the NEWKEYS dance
///
/// `session_id` is `None` for the connection's first exchange (the new
/// hash becomes the session id). Returns `None` when the client hangs
/// up before NEWKEYS.
async fn exchange_keys(
    framed: &mut Framed<DuplexStream, PacketCodec>,
    host_key: &SigningKey,
    client_version: &str,
    client_kexinit_payload: &[u8],
    server_kexinit_payload: &[u8],
    session_id: Option<&[u8]>,
) -> Option<Vec<u8>> {
    let client_public = match framed.next().await.unwrap().unwrap() {
        Message::KexEcdhInit { client_public } => client_public,
        other => panic!("expected KEX_ECDH_INIT, got {other:?}"),
    };
    let client_public_bytes: [u8; 32] = client_public.as_ref().try_into().unwrap();

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(client_public_bytes));

    let blob = host_key_blob(host_key);
    let hash = kex::exchange_hash(
        client_version,
        SERVER_VERSION,
        client_kexinit_payload,
        server_kexinit_payload,
        &blob,
        &client_public,
        server_public.as_bytes(),
        shared.as_bytes(),
    );

    let signature = host_key.sign(&hash);
    let mut signature_blob = BytesMut::new();
    wire::put_str(&mut signature_blob, "ssh-ed25519");
    wire::put_string(&mut signature_blob, &signature.to_bytes());

    framed
        .send(Message::KexEcdhReply {
            host_key_blob: blob,
            server_public: Bytes::copy_from_slice(server_public.as_bytes()),
            signature_blob: signature_blob.freeze(),
        })
        .await
        .unwrap();

    let keys = KeyMaterial::derive(shared.as_bytes(), &hash, session_id.unwrap_or(&hash));

    match framed.next().await {
        Some(Ok(Message::NewKeys)) => {}
        None | Some(Err(_)) => return None,
        Some(Ok(other)) => panic!("expected NEWKEYS, got {other:?}"),
    }
    framed.codec_mut().install_inbound(&keys.client_to_server);
    framed.send(Message::NewKeys).await.unwrap();
    framed.codec_mut().install_outbound(&keys.server_to_client);

    Some(hash)
}

/// Run the server side of banner exchange and key exchange
///
/// Returns `None` when the client tears the connection down before
/// NEWKEYS, which is the expected shape of a host-key rejection.
pub async fn handshake(mut stream: DuplexStream, host_key: &SigningKey) -> Option<TestServer> {
    stream
        .write_all(format!("{SERVER_VERSION}\r\n").as_bytes())
        .await
        .unwrap();

    let mut buffer = BytesMut::new();
    let client_version = loop {
        if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line = buffer.split_to(newline + 1);
            break std::str::from_utf8(&line[..newline])
                .unwrap()
                .trim_end_matches('\r')
                .to_owned();
        }
        assert_ne!(stream.read_buf(&mut buffer).await.unwrap(), 0);
    };
    assert!(client_version.starts_with("SSH-2.0-"));

    let mut parts = FramedParts::new(stream, PacketCodec::new());
    parts.read_buf = buffer;
    let mut framed = Framed::from_parts(parts);

    let client_init = match framed.next().await.unwrap().unwrap() {
        Message::KexInit(init) => init,
        other => panic!("expected KEXINIT, got {other:?}"),
    };
    let client_kexinit_payload = Message::KexInit(client_init).to_payload();

    let server_init = kex::local_kexinit();
    let server_kexinit_payload = Message::KexInit(server_init.clone()).to_payload();
    framed.send(Message::KexInit(server_init)).await.unwrap();

    let session_id = exchange_keys(
        &mut framed,
        host_key,
        &client_version,
        &client_kexinit_payload,
        &server_kexinit_payload,
        None,
    )
    .await?;

    Some(TestServer {
        framed,
        client_version,
        session_id,
    })
}

impl TestServer {
    pub async fn recv(&mut self) -> Message {
        self.framed
            .next()
            .await
            .expect("stream ended")
            .expect("decode failed")
    }

    pub async fn send(&mut self, message: Message) {
        self.framed.send(message).await.unwrap();
    }

    /// Initiate a re-key from the server side and complete it
    pub async fn rekey(&mut self, host_key: &SigningKey) {
        let server_init = kex::local_kexinit();
        let server_kexinit_payload = Message::KexInit(server_init.clone()).to_payload();
        self.send(Message::KexInit(server_init)).await;

        let client_init = match self.recv().await {
            Message::KexInit(init) => init,
            other => panic!("expected KEXINIT, got {other:?}"),
        };
        let client_kexinit_payload = Message::KexInit(client_init).to_payload();

        let client_version = self.client_version.clone();
        let session_id = self.session_id.clone();
        exchange_keys(
            &mut self.framed,
            host_key,
            &client_version,
            &client_kexinit_payload,
            &server_kexinit_payload,
            Some(&session_id),
        )
        .await
        .expect("client aborted re-key");
    }

    /// Complete a re-key the client initiated
    pub async fn accept_rekey(&mut self, host_key: &SigningKey) {
        let client_init = match self.recv().await {
            Message::KexInit(init) => init,
            other => panic!("expected KEXINIT, got {other:?}"),
        };
        let client_kexinit_payload = Message::KexInit(client_init).to_payload();

        let server_init = kex::local_kexinit();
        let server_kexinit_payload = Message::KexInit(server_init.clone()).to_payload();
        self.send(Message::KexInit(server_init)).await;

        let client_version = self.client_version.clone();
        let session_id = self.session_id.clone();
        exchange_keys(
            &mut self.framed,
            host_key,
            &client_version,
            &client_kexinit_payload,
            &server_kexinit_payload,
            Some(&session_id),
        )
        .await
        .expect("client aborted re-key");
    }

    /// Accept the ssh-userauth service request
    pub async fn accept_service(&mut self) {
        match self.recv().await {
            Message::ServiceRequest { service } => {
                assert_eq!(service, "ssh-userauth");
                self.send(Message::ServiceAccept { service }).await;
            }
            other => panic!("expected SERVICE_REQUEST, got {other:?}"),
        }
    }

    /// Accept exactly one password attempt matching the given pair
    pub async fn accept_password(&mut self, username: &str, password: &str) {
        self.accept_service().await;
        match self.recv().await {
            Message::UserauthRequest {
                username: got_user,
                method: AuthMethod::Password { password: got_pass },
                ..
            } => {
                assert_eq!(got_user, username);
                assert_eq!(got_pass, password);
                self.send(Message::UserauthSuccess).await;
            }
            other => panic!("expected password request, got {other:?}"),
        }
    }

    /// Accept a session channel open, advertising the given window
    ///
    /// Returns the client's channel id.
    pub async fn accept_session_channel(&mut self, initial_window: u32, max_packet: u32) -> u32 {
        match self.recv().await {
            Message::ChannelOpen {
                kind,
                sender_channel,
                ..
            } => {
                assert_eq!(kind, "session");
                self.send(Message::ChannelOpenConfirmation {
                    recipient_channel: sender_channel,
                    sender_channel: SERVER_CHANNEL_ID,
                    initial_window,
                    max_packet,
                })
                .await;
                sender_channel
            }
            other => panic!("expected CHANNEL_OPEN, got {other:?}"),
        }
    }

    /// Accept the pty-req/shell request pair a shell open sends
    pub async fn accept_shell(&mut self, client_id: u32) {
        match self.recv().await {
            Message::ChannelRequest {
                recipient_channel,
                want_reply: false,
                request: ChannelRequestKind::PtyReq { .. },
            } => assert_eq!(recipient_channel, SERVER_CHANNEL_ID),
            other => panic!("expected pty-req, got {other:?}"),
        }
        match self.recv().await {
            Message::ChannelRequest {
                want_reply: true,
                request: ChannelRequestKind::Shell,
                ..
            } => {
                self.send(Message::ChannelSuccess {
                    recipient_channel: client_id,
                })
                .await;
            }
            other => panic!("expected shell request, got {other:?}"),
        }
    }

    /// Expect the client's EOF then CLOSE for a channel
    pub async fn expect_channel_teardown(&mut self) {
        match self.recv().await {
            Message::ChannelEof { recipient_channel } => {
                assert_eq!(recipient_channel, SERVER_CHANNEL_ID)
            }
            other => panic!("expected CHANNEL_EOF, got {other:?}"),
        }
        match self.recv().await {
            Message::ChannelClose { recipient_channel } => {
                assert_eq!(recipient_channel, SERVER_CHANNEL_ID)
            }
            other => panic!("expected CHANNEL_CLOSE, got {other:?}"),
        }
    }
}
