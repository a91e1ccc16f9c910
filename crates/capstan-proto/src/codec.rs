//! Binary packet codec (RFC 4253 §6)
//!
//! Frame layout on the wire:
//!
//! ```text
//! uint32    packet_length  (padding_length byte + payload + padding)
//! byte      padding_length (>= 4)
//! byte[n]   payload
//! byte[m]   random padding
//! byte[32]  MAC            (only once keys are installed)
//! ```
//!
//! The whole packet including the length field is a multiple of the
//! cipher block size (8 before keys are installed, 16 for aes128-ctr).
//! Sequence numbers run per direction from zero, wrap at 2^32, and are
//! prepended to the cleartext packet for the MAC computation.
//!
//! Decoding is resumable: until a complete frame (and its MAC) is
//! buffered, `decode` returns `Ok(None)` and consumes nothing. In
//! encrypted mode the first block is decrypted on a cloned cipher state
//! to learn the packet length, so the live keystream only ever advances
//! once per packet.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use constant_time_eq::constant_time_eq;
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::keys::{DirectionKeys, CIPHER_BLOCK_LEN, MAC_KEY_LEN};
use crate::msg::Message;

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted packet_length value; larger is a protocol violation
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Minimum padding required by the protocol
const MIN_PADDING: usize = 4;

/// Block alignment before any cipher is negotiated
const CLEAR_BLOCK_LEN: usize = 8;

/// Cipher and MAC state for one direction
struct Direction {
    cipher: Aes128Ctr,
    mac_key: [u8; MAC_KEY_LEN],
}

impl Direction {
    fn new(keys: &DirectionKeys) -> Self {
        Self {
            cipher: Aes128Ctr::new(&keys.cipher_key.into(), &keys.iv.into()),
            mac_key: keys.mac_key,
        }
    }

    fn compute_mac(&self, sequence: u32, clear_packet: &[u8]) -> [u8; MAC_KEY_LEN] {
        // new_from_slice only fails on invalid key lengths, which the
        // fixed-size key rules out
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts 32-byte keys"));
        mac.update(&sequence.to_be_bytes());
        mac.update(clear_packet);
        mac.finalize().into_bytes().into()
    }
}

/// Codec for encoding/decoding SSH binary packets
///
/// Starts in cleartext mode; `install_outbound`/`install_inbound` switch
/// each direction independently, matching the NEWKEYS handshake where the
/// two sides activate at different instants. Sequence numbers are never
/// reset, including across re-keys.
#[derive(Default)]
pub struct PacketCodec {
    outbound: Option<Direction>,
    inbound: Option<Direction>,
    send_sequence: u32,
    recv_sequence: u32,
    /// packet_length of a partially buffered inbound frame
    pending_length: Option<usize>,
    /// bytes encoded since the outbound keys were last installed
    bytes_sent: u64,
}

impl PacketCodec {
    /// Create a new codec in cleartext mode
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate encryption and MAC for packets we send
    pub fn install_outbound(&mut self, keys: &DirectionKeys) {
        self.outbound = Some(Direction::new(keys));
        self.bytes_sent = 0;
    }

    /// Activate decryption and MAC verification for packets we receive
    pub fn install_inbound(&mut self, keys: &DirectionKeys) {
        self.inbound = Some(Direction::new(keys));
    }

    /// Whether outbound packets are currently encrypted
    pub fn is_encrypted(&self) -> bool {
        self.outbound.is_some()
    }

    /// Bytes encoded under the current outbound keys; drives the
    /// data-volume re-key trigger
    pub fn outbound_bytes(&self) -> u64 {
        self.bytes_sent
    }

    /// Sequence number of the most recently decoded packet
    pub fn last_recv_sequence(&self) -> u32 {
        self.recv_sequence.wrapping_sub(1)
    }

    fn block_len(encrypted: bool) -> usize {
        if encrypted {
            CIPHER_BLOCK_LEN
        } else {
            CLEAR_BLOCK_LEN
        }
    }

    /// Read the packet_length of the buffered frame without consuming
    /// input or advancing cipher state.
    fn peek_length(&mut self, src: &BytesMut) -> Option<Result<usize, WireError>> {
        if let Some(len) = self.pending_length {
            return Some(Ok(len));
        }

        let length = match &self.inbound {
            None => {
                if src.len() < 4 {
                    return None;
                }
                u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize
            }
            Some(direction) => {
                if src.len() < CIPHER_BLOCK_LEN {
                    return None;
                }
                let mut block = [0u8; CIPHER_BLOCK_LEN];
                block.copy_from_slice(&src[..CIPHER_BLOCK_LEN]);
                direction.cipher.clone().apply_keystream(&mut block);
                u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize
            }
        };

        if length > MAX_PACKET_SIZE {
            return Some(Err(WireError::PacketTooLarge {
                size: length,
                max: MAX_PACKET_SIZE,
            }));
        }
        if length < MIN_PADDING + 1 {
            return Some(Err(WireError::MalformedPacket("packet_length too small")));
        }
        if (4 + length) % Self::block_len(self.inbound.is_some()) != 0 {
            return Some(Err(WireError::MalformedPacket(
                "packet not block-aligned",
            )));
        }

        self.pending_length = Some(length);
        Some(Ok(length))
    }
}

impl Decoder for PacketCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.peek_length(src) {
            None => return Ok(None),
            Some(result) => result?,
        };

        let mac_len = if self.inbound.is_some() { MAC_KEY_LEN } else { 0 };
        let total = 4 + length + mac_len;
        if src.len() < total {
            // Header length retained; no bytes consumed
            return Ok(None);
        }
        self.pending_length = None;

        let mut packet = src.split_to(4 + length);
        let received_mac = if mac_len > 0 {
            Some(src.split_to(mac_len))
        } else {
            None
        };

        if let Some(direction) = &mut self.inbound {
            direction.cipher.apply_keystream(&mut packet);
        }

        if let (Some(direction), Some(received)) = (&self.inbound, received_mac) {
            let expected = direction.compute_mac(self.recv_sequence, &packet);
            if !constant_time_eq(&expected, &received) {
                return Err(WireError::MacMismatch);
            }
        }
        self.recv_sequence = self.recv_sequence.wrapping_add(1);

        packet.advance(4);
        let padding_length = packet.get_u8() as usize;
        if padding_length < MIN_PADDING || padding_length + 1 > length {
            return Err(WireError::MalformedPacket("bad padding length"));
        }
        let payload_length = length - 1 - padding_length;
        let payload: Bytes = packet.split_to(payload_length).freeze();

        let message = Message::decode(payload)?;
        tracing::trace!(message_type = ?message.message_type(), "decoded packet");
        Ok(Some(message))
    }
}

impl Encoder<Message> for PacketCodec {
    type Error = WireError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = message.to_payload();
        if payload.len() > MAX_PACKET_SIZE {
            return Err(WireError::PacketTooLarge {
                size: payload.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let block = Self::block_len(self.outbound.is_some());
        let mut padding = block - ((4 + 1 + payload.len()) % block);
        if padding < MIN_PADDING {
            padding += block;
        }
        let packet_length = 1 + payload.len() + padding;

        let mut packet = BytesMut::with_capacity(4 + packet_length + MAC_KEY_LEN);
        packet.put_u32(packet_length as u32);
        packet.put_u8(padding as u8);
        packet.extend_from_slice(&payload);

        let mut pad_bytes = vec![0u8; padding];
        rand::thread_rng().fill_bytes(&mut pad_bytes);
        packet.extend_from_slice(&pad_bytes);

        let mac = self
            .outbound
            .as_ref()
            .map(|direction| direction.compute_mac(self.send_sequence, &packet));
        self.send_sequence = self.send_sequence.wrapping_add(1);

        if let Some(direction) = &mut self.outbound {
            direction.cipher.apply_keystream(&mut packet);
        }

        dst.extend_from_slice(&packet);
        if let Some(mac) = mac {
            dst.extend_from_slice(&mac);
        }
        self.bytes_sent += (4 + packet_length) as u64;

        tracing::trace!(
            message_type = ?message.message_type(),
            encrypted = self.outbound.is_some(),
            "encoded packet"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyMaterial;

    fn sample_message() -> Message {
        Message::ChannelData {
            recipient_channel: 1,
            data: Bytes::from_static(b"echo hi\n"),
        }
    }

    fn keyed_pair() -> (PacketCodec, PacketCodec) {
        let keys = KeyMaterial::derive(&[0x42; 32], &[0x17; 32], &[0x17; 32]);

        let mut client = PacketCodec::new();
        client.install_outbound(&keys.client_to_server);
        client.install_inbound(&keys.server_to_client);

        let mut server = PacketCodec::new();
        server.install_outbound(&keys.server_to_client);
        server.install_inbound(&keys.client_to_server);

        (client, server)
    }

    #[test]
    fn test_clear_roundtrip() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(sample_message(), &mut buf).unwrap();

        // Cleartext packets are 8-byte aligned
        assert_eq!(buf.len() % 8, 0);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample_message());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encrypted_roundtrip_both_directions() {
        let (mut client, mut server) = keyed_pair();

        let mut buf = BytesMut::new();
        client.encode(sample_message(), &mut buf).unwrap();
        assert_eq!((buf.len() - MAC_KEY_LEN) % CIPHER_BLOCK_LEN, 0);
        let decoded = server.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample_message());

        let reply = Message::ChannelData {
            recipient_channel: 0,
            data: Bytes::from_static(b"hi\n"),
        };
        let mut buf = BytesMut::new();
        server.encode(reply.clone(), &mut buf).unwrap();
        let decoded = client.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_partial_input_never_consumes() {
        let (mut client, mut server) = keyed_pair();

        let mut full = BytesMut::new();
        client.encode(sample_message(), &mut full).unwrap();

        // Feed the frame one byte at a time; every prefix must yield
        // None and leave the buffer untouched.
        let mut feed = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            if i + 1 < full.len() {
                feed.put_u8(*byte);
                let before = feed.len();
                assert!(server.decode(&mut feed).unwrap().is_none());
                assert_eq!(feed.len(), before);
            }
        }

        feed.put_u8(full[full.len() - 1]);
        let decoded = server.decode(&mut feed).unwrap().unwrap();
        assert_eq!(decoded, sample_message());
    }

    #[test]
    fn test_sequence_numbers_advance() {
        let (mut client, mut server) = keyed_pair();

        // Several packets in a row keep verifying; any drift in the
        // sequence counters would break the MACs.
        for i in 0..5u32 {
            let message = Message::ChannelWindowAdjust {
                recipient_channel: 0,
                additional_bytes: i,
            };
            let mut buf = BytesMut::new();
            client.encode(message.clone(), &mut buf).unwrap();
            assert_eq!(server.decode(&mut buf).unwrap().unwrap(), message);
        }
    }

    #[test]
    fn test_tampered_mac_fails() {
        let (mut client, mut server) = keyed_pair();

        let mut buf = BytesMut::new();
        client.encode(sample_message(), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;

        assert!(matches!(
            server.decode(&mut buf),
            Err(WireError::MacMismatch)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (mut client, mut server) = keyed_pair();

        let mut buf = BytesMut::new();
        client.encode(sample_message(), &mut buf).unwrap();
        buf[6] ^= 0xFF;

        assert!(matches!(
            server.decode(&mut buf),
            Err(WireError::MacMismatch)
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_PACKET_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 12]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn test_minimum_padding() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::NewKeys, &mut buf)
            .unwrap();

        let padding = buf[4] as usize;
        assert!(padding >= MIN_PADDING);
    }
}
