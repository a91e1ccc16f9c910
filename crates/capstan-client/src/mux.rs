//! Channel multiplexing and flow control (RFC 4254)
//!
//! Pure state machines driven by the connection worker: no I/O here.
//! Each channel tracks both windows, a pending output buffer, and the
//! per-direction EOF/CLOSE bookkeeping. Output beyond the remote window
//! is buffered, never dropped; the local window is replenished
//! proactively once consumption crosses a low-water mark so neither
//! side can deadlock waiting for the other's window grant.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use capstan_core::Error;

/// Receive window advertised when opening a channel
pub const DEFAULT_INITIAL_WINDOW: u32 = 2 * 1024 * 1024;

/// Largest data packet we accept on a channel
pub const DEFAULT_MAX_PACKET: u32 = 32 * 1024;

/// Lifecycle of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// CHANNEL_OPEN sent, confirmation pending
    Opening,
    /// Confirmed; data may flow
    Open,
    /// Both sides have sent CHANNEL_CLOSE
    Closed,
}

/// Per-channel flow-control and lifecycle state
#[derive(Debug)]
pub struct ChannelState {
    local_id: u32,
    remote_id: Option<u32>,
    phase: ChannelPhase,

    /// Bytes the peer may still send us
    local_window: u32,
    local_initial_window: u32,
    /// Inbound bytes consumed since the last window grant
    consumed: u32,

    /// Bytes we may still send the peer
    remote_window: u32,
    remote_max_packet: u32,

    /// Output queued while the remote window is exhausted
    pending_out: BytesMut,

    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,
}

impl ChannelState {
    fn new(local_id: u32, initial_window: u32) -> Self {
        Self {
            local_id,
            remote_id: None,
            phase: ChannelPhase::Opening,
            local_window: initial_window,
            local_initial_window: initial_window,
            consumed: 0,
            remote_window: 0,
            remote_max_packet: 0,
            pending_out: BytesMut::new(),
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Remote id; only valid once the open was confirmed
    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    /// Bind the peer's id and window on CHANNEL_OPEN_CONFIRMATION
    pub fn confirm(&mut self, remote_id: u32, remote_window: u32, remote_max_packet: u32) {
        self.remote_id = Some(remote_id);
        self.remote_window = remote_window;
        self.remote_max_packet = remote_max_packet.max(1);
        self.phase = ChannelPhase::Open;
    }

    /// Queue output; call `take_sendable` afterwards to drain what the
    /// window currently permits
    pub fn queue_output(&mut self, data: &[u8]) {
        self.pending_out.extend_from_slice(data);
    }

    /// Bytes still buffered waiting for window
    pub fn pending_output(&self) -> usize {
        self.pending_out.len()
    }

    /// Drain as much pending output as the remote window allows, split
    /// into chunks no larger than the remote maximum packet size,
    /// capped at our own packet budget
    pub fn take_sendable(&mut self) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.phase != ChannelPhase::Open || self.close_sent || self.eof_sent {
            return chunks;
        }
        // A peer may advertise a maximum above what our codec will
        // frame; chunks stay within DEFAULT_MAX_PACKET regardless
        let max_chunk = self.remote_max_packet.min(DEFAULT_MAX_PACKET) as usize;
        while self.remote_window > 0 && !self.pending_out.is_empty() {
            let take = (self.remote_window as usize)
                .min(max_chunk)
                .min(self.pending_out.len());
            self.remote_window -= take as u32;
            chunks.push(self.pending_out.split_to(take).freeze());
        }
        chunks
    }

    /// Handle CHANNEL_WINDOW_ADJUST from the peer
    pub fn grow_remote_window(&mut self, additional: u32) -> Result<(), Error> {
        self.remote_window = self
            .remote_window
            .checked_add(additional)
            .ok_or_else(|| Error::ProtocolViolation("remote window overflow".into()))?;
        Ok(())
    }

    /// Account for inbound data. Returns the window grant to send when
    /// consumption crossed the low-water mark.
    pub fn register_inbound(&mut self, len: u32) -> Result<Option<u32>, Error> {
        if len > self.local_window {
            return Err(Error::ProtocolViolation(
                "peer exceeded advertised window".into(),
            ));
        }
        self.local_window -= len;
        self.consumed += len;

        if self.consumed >= self.local_initial_window / 2 {
            let grant = self.consumed;
            self.consumed = 0;
            self.local_window += grant;
            Ok(Some(grant))
        } else {
            Ok(None)
        }
    }

    pub fn note_eof_sent(&mut self) {
        self.eof_sent = true;
    }

    pub fn note_eof_received(&mut self) {
        self.eof_received = true;
    }

    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    pub fn note_close_sent(&mut self) {
        self.close_sent = true;
        self.update_phase();
    }

    pub fn note_close_received(&mut self) {
        self.close_received = true;
        self.update_phase();
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    pub fn close_received(&self) -> bool {
        self.close_received
    }

    fn update_phase(&mut self) {
        if self.close_sent && self.close_received {
            self.phase = ChannelPhase::Closed;
        }
    }

    /// Closed in both directions
    pub fn is_fully_closed(&self) -> bool {
        self.phase == ChannelPhase::Closed
    }
}

/// All channels multiplexed over one connection
#[derive(Debug, Default)]
pub struct Multiplexer {
    channels: HashMap<u32, ChannelState>,
    next_id: u32,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a channel with a fresh local id
    pub fn allocate(&mut self, initial_window: u32) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.channels.insert(id, ChannelState::new(id, initial_window));
        id
    }

    /// Look up a channel by the recipient id in an inbound message
    pub fn get_mut(&mut self, local_id: u32) -> Result<&mut ChannelState, Error> {
        self.channels.get_mut(&local_id).ok_or_else(|| {
            Error::ProtocolViolation(format!("message for unknown channel {local_id}"))
        })
    }

    pub fn get(&self, local_id: u32) -> Option<&ChannelState> {
        self.channels.get(&local_id)
    }

    pub fn remove(&mut self, local_id: u32) -> Option<ChannelState> {
        self.channels.remove(&local_id)
    }

    /// Local ids of all live channels
    pub fn ids(&self) -> Vec<u32> {
        self.channels.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
