//! Encrypted transport over one byte stream
//!
//! Owns the socket, the packet codec, and the negotiation state machine:
//!
//! ```text
//! Init -> VersionExchanged -> KexInProgress -> KeysEstablished
//!                                  ^                 |
//!                                  +--- ReKeying <---+
//! ```
//!
//! Version banners are plain newline-terminated text exchanged before
//! any framing applies; everything after is binary packets. The
//! transport also filters protocol chatter (IGNORE, DEBUG) and turns a
//! peer DISCONNECT or stream end into `ConnectionClosed` so the layers
//! above only ever see meaningful messages.

pub mod kex;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, FramedParts};

use capstan_core::Error;
use capstan_proto::{Message, PacketCodec, WireError};

/// Identification string sent to the peer (without the trailing CRLF)
pub const CLIENT_VERSION: &str = concat!("SSH-2.0-capstan_", env!("CARGO_PKG_VERSION"));

/// Maximum length of one identification line (RFC 4253 §4.2)
const MAX_VERSION_LINE: usize = 255;

/// Cap on pre-banner noise a server may send before its version line
const MAX_PREAMBLE: usize = 8 * 1024;

/// Outbound bytes under one key set before the client re-keys
pub const REKEY_AFTER_BYTES: u64 = 1 << 30;

/// Transport negotiation states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Init,
    VersionExchanged,
    KexInProgress,
    KeysEstablished,
    ReKeying,
    Closed,
}

/// The encrypted transport: framed packet stream plus negotiation state
pub struct Transport<S> {
    framed: Framed<S, PacketCodec>,
    state: TransportState,
    local_version: String,
    peer_version: String,
    /// Exchange hash of the first key exchange; fixed for the
    /// connection lifetime
    session_id: Option<Vec<u8>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Exchange identification strings and frame the stream
    ///
    /// Lines before the peer's `SSH-` banner are permitted and skipped;
    /// bytes after its banner are handed to the packet codec untouched.
    pub async fn exchange_versions(mut stream: S) -> Result<Self, Error> {
        stream
            .write_all(format!("{}\r\n", CLIENT_VERSION).as_bytes())
            .await?;

        let mut buffer = BytesMut::with_capacity(256);
        let peer_version = loop {
            if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line = buffer.split_to(newline + 1);
                let line = std::str::from_utf8(&line[..newline])
                    .map_err(|_| Error::ProtocolViolation("non-UTF-8 banner line".into()))?
                    .trim_end_matches('\r');

                if line.len() > MAX_VERSION_LINE {
                    return Err(Error::ProtocolViolation("banner line too long".into()));
                }
                if line.starts_with("SSH-") {
                    break line.to_owned();
                }
                // Pre-banner chatter; servers may send any number of
                // plain lines first
                tracing::trace!(line, "skipping pre-banner line");
                continue;
            }

            if buffer.len() > MAX_PREAMBLE {
                return Err(Error::ProtocolViolation("banner preamble too long".into()));
            }
            let read = stream.read_buf(&mut buffer).await?;
            if read == 0 {
                return Err(Error::ConnectionClosed);
            }
        };

        if !peer_version.starts_with("SSH-2.0-") && !peer_version.starts_with("SSH-1.99-") {
            return Err(Error::ProtocolViolation(format!(
                "unsupported protocol version: {peer_version}"
            )));
        }
        tracing::debug!(peer = %peer_version, "version exchange complete");

        // Bytes past the banner belong to the first binary packet
        let mut parts = FramedParts::new(stream, PacketCodec::new());
        parts.read_buf = buffer;

        Ok(Self {
            framed: Framed::from_parts(parts),
            state: TransportState::VersionExchanged,
            local_version: CLIENT_VERSION.to_owned(),
            peer_version,
            session_id: None,
        })
    }

    /// Current negotiation state
    pub fn state(&self) -> TransportState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TransportState) {
        tracing::trace!(?state, "transport state");
        self.state = state;
    }

    /// Session identifier, available once the first kex completed
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Local identification string (no CRLF)
    pub fn local_version(&self) -> &str {
        &self.local_version
    }

    /// Peer identification string (no CRLF)
    pub fn peer_version(&self) -> &str {
        &self.peer_version
    }

    /// Whether enough data went out under the current keys to warrant
    /// a client-initiated re-key
    pub fn should_rekey(&self) -> bool {
        self.state == TransportState::KeysEstablished
            && self.framed.codec().outbound_bytes() > REKEY_AFTER_BYTES
    }

    pub(crate) fn codec_mut(&mut self) -> &mut PacketCodec {
        self.framed.codec_mut()
    }

    /// Send one message
    pub async fn send(&mut self, message: Message) -> Result<(), Error> {
        if self.state == TransportState::Closed {
            return Err(Error::ConnectionClosed);
        }
        self.framed.send(message).await?;
        Ok(())
    }

    /// Receive the next meaningful message
    ///
    /// IGNORE and DEBUG are dropped, UNIMPLEMENTED is logged, unknown
    /// message numbers are answered with UNIMPLEMENTED, and DISCONNECT
    /// or stream end becomes `ConnectionClosed`.
    pub async fn recv(&mut self) -> Result<Message, Error> {
        loop {
            match self.framed.next().await {
                None => {
                    self.state = TransportState::Closed;
                    return Err(Error::ConnectionClosed);
                }
                Some(Err(WireError::UnknownMessageType(value))) => {
                    tracing::warn!(message_type = value, "unknown message from peer");
                    let sequence_number = self.framed.codec().last_recv_sequence();
                    self.send(Message::Unimplemented { sequence_number }).await?;
                }
                Some(Err(error)) => {
                    self.state = TransportState::Closed;
                    return Err(error.into());
                }
                Some(Ok(Message::Ignore { .. })) => {}
                Some(Ok(Message::Debug { message, .. })) => {
                    tracing::debug!(message, "peer debug message");
                }
                Some(Ok(Message::Unimplemented { sequence_number })) => {
                    tracing::warn!(sequence_number, "peer reported unimplemented message");
                }
                Some(Ok(Message::Disconnect {
                    reason_code,
                    description,
                })) => {
                    tracing::info!(reason_code, description, "peer disconnected");
                    self.state = TransportState::Closed;
                    return Err(Error::ConnectionClosed);
                }
                Some(Ok(message)) => return Ok(message),
            }
        }
    }

    pub(crate) fn set_session_id(&mut self, session_id: Vec<u8>) {
        if self.session_id.is_none() {
            self.session_id = Some(session_id);
        }
    }
}
