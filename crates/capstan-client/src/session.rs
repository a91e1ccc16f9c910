//! Session façade and connection worker
//!
//! The public face of the client: `Session::connect` runs TCP
//! establishment, version exchange, key exchange, and authentication in
//! order, then hands the transport to a dedicated worker task. The
//! worker owns every piece of per-connection state (codec, negotiator,
//! multiplexer), so all of it is single-threaded by construction;
//! callers talk to it through command and event channels.
//!
//! Ordering guarantees: authentication completes before any channel
//! open is accepted (channel opens only exist once `handshake`
//! returned), re-keys are invisible to channel callers, and tearing
//! down the connection resolves every pending operation with
//! `ConnectionClosed`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use capstan_core::{ChannelId, ConnectOptions, Error, HostKeyVerifier};
use capstan_proto::msg::{disconnect_reason, EXTENDED_DATA_STDERR};
use capstan_proto::{ChannelRequestKind, Message};

use crate::auth;
use crate::mux::{ChannelState, Multiplexer, DEFAULT_INITIAL_WINDOW, DEFAULT_MAX_PACKET};
use crate::transport::{kex, Transport, TransportState};

/// Capacity of the per-channel event queue.
///
/// Holds decoded events between the worker and a channel consumer.
/// 256 gives headroom for bursts of small data packets while a caller
/// is briefly busy; beyond that the worker applies backpressure.
const CHANNEL_EVENT_CAPACITY: usize = 256;

/// Capacity of the command queue from all handles into the worker
const COMMAND_CAPACITY: usize = 256;

/// Events delivered on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Primary data stream bytes
    Data(Bytes),
    /// Extended data; `data_type` 1 is stderr
    ExtendedData { data_type: u32, data: Bytes },
    /// Peer will send no more data
    Eof,
    /// Remote process exit status
    ExitStatus(u32),
    /// Remote process killed by a signal
    ExitSignal { signal: String },
    /// Channel closed in both directions by the close protocol.
    ///
    /// Only orderly closes produce this event; losing the connection
    /// ends the event stream without it.
    Closed,
}

/// What to run on a freshly opened session channel
#[derive(Debug, Clone)]
enum OpenSpec {
    Shell { term: String, cols: u32, rows: u32 },
    Exec { command: String },
}

enum Command {
    Open {
        spec: OpenSpec,
        reply: oneshot::Sender<Result<Channel, Error>>,
    },
    Write {
        id: u32,
        data: Bytes,
    },
    Close {
        id: u32,
    },
    Rekey {
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// An open channel on a session
///
/// Writes are buffered against the remote flow-control window and
/// never dropped; events arrive in `recv` in the order the peer sent
/// them. After `Closed` (or `None`, if the connection died first) no
/// further events fire.
pub struct Channel {
    id: ChannelId,
    command_tx: mpsc::Sender<Command>,
    events: mpsc::Receiver<ChannelEvent>,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queue bytes for the channel's primary stream
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.command_tx
            .send(Command::Write {
                id: self.id.as_u32(),
                data: data.into(),
            })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Next event; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Close the channel; other channels are unaffected
    pub async fn close(&self) -> Result<(), Error> {
        self.command_tx
            .send(Command::Close {
                id: self.id.as_u32(),
            })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

// Handles render as opaque markers; no queue internals in logs
impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

/// An authenticated SSH session
pub struct Session {
    command_tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Session")
    }
}

impl Session {
    /// Connect, negotiate, and authenticate per `options`
    pub async fn connect(options: ConnectOptions) -> Result<Self, Error> {
        let address = options.address();
        tracing::debug!(%address, "connecting");

        let stream = timeout(options.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::Connect(format!("connect to {address} timed out")))?
            .map_err(|e| Error::Connect(format!("{address}: {e}")))?;

        Self::handshake(stream, options).await
    }

    /// Run the SSH handshake over an established byte stream
    ///
    /// Split out from `connect` so in-memory transports can stand in
    /// for TCP. The handshake timeout covers version exchange through
    /// authentication; expiry tears the stream down.
    pub async fn handshake<S>(stream: S, options: ConnectOptions) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let host = options.host.clone();
        let port = options.port;
        let verifier = Arc::clone(&options.verifier);

        let transport = timeout(options.handshake_timeout, async {
            let mut transport = Transport::exchange_versions(stream).await?;
            let deferred = kex::run(&mut transport, &host, port, &verifier, None).await?;
            if !deferred.is_empty() {
                return Err(Error::ProtocolViolation(
                    "connection traffic before initial key exchange".into(),
                ));
            }
            auth::authenticate(&mut transport, &options.username, &options.credentials).await?;
            Ok::<_, Error>(transport)
        })
        .await
        .map_err(|_| Error::Connect("handshake timed out".into()))??;

        tracing::info!(host = %options.host, user = %options.username, "session ready");

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let worker = Worker {
            transport,
            mux: Multiplexer::new(),
            plumbing: HashMap::new(),
            command_tx: command_tx.clone(),
            command_rx,
            deferred: VecDeque::new(),
            host,
            port,
            verifier,
        };
        tokio::spawn(worker.run());

        Ok(Self { command_tx })
    }

    /// Open a session channel running an interactive shell with a PTY
    pub async fn open_shell(&self) -> Result<Channel, Error> {
        self.open(OpenSpec::Shell {
            term: "xterm-256color".to_owned(),
            cols: 80,
            rows: 24,
        })
        .await
    }

    /// Open a session channel running a single command (no PTY)
    pub async fn open_exec(&self, command: impl Into<String>) -> Result<Channel, Error> {
        self.open(OpenSpec::Exec {
            command: command.into(),
        })
        .await
    }

    async fn open(&self, spec: OpenSpec) -> Result<Channel, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Open {
                spec,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Force a re-key now instead of waiting for the volume threshold
    ///
    /// Resolves once the new keys are live. Channel traffic queued in
    /// the meantime goes out under them.
    pub async fn rekey(&self) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Rekey { reply: reply_tx })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        reply_rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Politely disconnect, closing all channels
    pub async fn disconnect(self) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Disconnect { reply: reply_tx })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        let _ = reply_rx.await;
        Ok(())
    }
}

/// Caller-side plumbing for one channel, held by the worker
struct ChannelPlumbing {
    event_tx: mpsc::Sender<ChannelEvent>,
    /// Present until the open is confirmed or rejected
    pending: Option<PendingOpen>,
}

struct PendingOpen {
    reply: oneshot::Sender<Result<Channel, Error>>,
    event_rx: mpsc::Receiver<ChannelEvent>,
    spec: OpenSpec,
}

/// The per-connection worker task; sole owner of transport and mux state
struct Worker<S> {
    transport: Transport<S>,
    mux: Multiplexer,
    plumbing: HashMap<u32, ChannelPlumbing>,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    /// Connection-layer messages that arrived during a re-key
    deferred: VecDeque<Message>,
    host: String,
    port: u16,
    verifier: Arc<dyn HostKeyVerifier>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Worker<S> {
    async fn run(mut self) {
        let result = self.event_loop().await;
        match result {
            Ok(()) => tracing::debug!("connection worker finished"),
            Err(error) => {
                tracing::warn!(%error, "connection failed");
                // Best-effort notice to the peer for protocol-level faults
                let reason = if matches!(error, Error::Integrity) {
                    disconnect_reason::MAC_ERROR
                } else {
                    disconnect_reason::PROTOCOL_ERROR
                };
                let _ = self
                    .transport
                    .send(Message::Disconnect {
                        reason_code: reason,
                        description: error.to_string(),
                    })
                    .await;
            }
        }
        self.fail_all().await;
    }

    async fn event_loop(&mut self) -> Result<(), Error> {
        loop {
            while let Some(message) = self.deferred.pop_front() {
                self.handle_message(message).await?;
            }

            if self.transport.should_rekey() {
                tracing::debug!("re-key threshold reached");
                let deferred = kex::run(
                    &mut self.transport,
                    &self.host,
                    self.port,
                    &self.verifier,
                    None,
                )
                .await?;
                self.deferred.extend(deferred);
                continue;
            }

            tokio::select! {
                command = self.command_rx.recv() => match command {
                    None => {
                        // Session handle dropped; say goodbye and stop
                        let _ = self.transport.send(Message::Disconnect {
                            reason_code: disconnect_reason::BY_APPLICATION,
                            description: "closing".to_owned(),
                        }).await;
                        return Ok(());
                    }
                    Some(command) => {
                        if !self.handle_command(command).await? {
                            return Ok(());
                        }
                    }
                },
                message = self.transport.recv() => {
                    self.handle_message(message?).await?;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<bool, Error> {
        match command {
            Command::Open { spec, reply } => {
                let id = self.mux.allocate(DEFAULT_INITIAL_WINDOW);
                let (event_tx, event_rx) = mpsc::channel(CHANNEL_EVENT_CAPACITY);
                self.plumbing.insert(
                    id,
                    ChannelPlumbing {
                        event_tx,
                        pending: Some(PendingOpen {
                            reply,
                            event_rx,
                            spec,
                        }),
                    },
                );
                self.transport
                    .send(Message::ChannelOpen {
                        kind: "session".to_owned(),
                        sender_channel: id,
                        initial_window: DEFAULT_INITIAL_WINDOW,
                        max_packet: DEFAULT_MAX_PACKET,
                        data: Bytes::new(),
                    })
                    .await?;
            }
            Command::Write { id, data } => {
                // The channel may have closed while the command was in
                // flight; that is not an error
                if let Ok(state) = self.mux.get_mut(id) {
                    state.queue_output(&data);
                    self.flush_channel(id).await?;
                } else {
                    tracing::debug!(channel = id, "write to closed channel dropped");
                }
            }
            Command::Close { id } => {
                if self.mux.get(id).is_some() {
                    self.flush_channel(id).await?;
                    self.send_close(id).await?;
                    self.reap_if_closed(id).await;
                }
            }
            Command::Rekey { reply } => {
                if self.transport.state() == TransportState::KeysEstablished {
                    let deferred = kex::run(
                        &mut self.transport,
                        &self.host,
                        self.port,
                        &self.verifier,
                        None,
                    )
                    .await?;
                    self.deferred.extend(deferred);
                    self.flush_all().await?;
                }
                let _ = reply.send(());
            }
            Command::Disconnect { reply } => {
                let _ = self
                    .transport
                    .send(Message::Disconnect {
                        reason_code: disconnect_reason::BY_APPLICATION,
                        description: "closing".to_owned(),
                    })
                    .await;
                let _ = reply.send(());
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), Error> {
        match message {
            Message::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window,
                max_packet,
            } => {
                let state = self.mux.get_mut(recipient_channel)?;
                state.confirm(sender_channel, initial_window, max_packet);
                let remote_id = sender_channel;

                let Some(plumbing) = self.plumbing.get_mut(&recipient_channel) else {
                    return Err(Error::ProtocolViolation(
                        "confirmation for unknown channel".into(),
                    ));
                };
                let Some(pending) = plumbing.pending.take() else {
                    return Err(Error::ProtocolViolation(
                        "duplicate channel open confirmation".into(),
                    ));
                };

                match &pending.spec {
                    OpenSpec::Shell { term, cols, rows } => {
                        self.transport
                            .send(Message::ChannelRequest {
                                recipient_channel: remote_id,
                                want_reply: false,
                                request: ChannelRequestKind::PtyReq {
                                    term: term.clone(),
                                    cols: *cols,
                                    rows: *rows,
                                    width_px: 0,
                                    height_px: 0,
                                    modes: Bytes::from_static(&[0]),
                                },
                            })
                            .await?;
                        self.transport
                            .send(Message::ChannelRequest {
                                recipient_channel: remote_id,
                                want_reply: true,
                                request: ChannelRequestKind::Shell,
                            })
                            .await?;
                    }
                    OpenSpec::Exec { command } => {
                        self.transport
                            .send(Message::ChannelRequest {
                                recipient_channel: remote_id,
                                want_reply: true,
                                request: ChannelRequestKind::Exec {
                                    command: command.clone(),
                                },
                            })
                            .await?;
                    }
                }

                let channel = Channel {
                    id: ChannelId::new(recipient_channel),
                    command_tx: self.command_tx.clone(),
                    events: pending.event_rx,
                };
                let _ = pending.reply.send(Ok(channel));
                tracing::debug!(channel = recipient_channel, "channel open");
            }
            Message::ChannelOpenFailure {
                recipient_channel,
                reason_code,
                description,
                ..
            } => {
                self.mux.remove(recipient_channel);
                if let Some(plumbing) = self.plumbing.remove(&recipient_channel) {
                    if let Some(pending) = plumbing.pending {
                        let _ = pending.reply.send(Err(Error::ChannelOpenRejected {
                            reason_code,
                            description,
                        }));
                    }
                }
            }
            Message::ChannelWindowAdjust {
                recipient_channel,
                additional_bytes,
            } => {
                self.mux
                    .get_mut(recipient_channel)?
                    .grow_remote_window(additional_bytes)?;
                self.flush_channel(recipient_channel).await?;
            }
            Message::ChannelData {
                recipient_channel,
                data,
            } => {
                let grant = self
                    .mux
                    .get_mut(recipient_channel)?
                    .register_inbound(data.len() as u32)?;
                self.replenish(recipient_channel, grant).await?;
                self.emit(recipient_channel, ChannelEvent::Data(data)).await;
            }
            Message::ChannelExtendedData {
                recipient_channel,
                data_type,
                data,
            } => {
                let grant = self
                    .mux
                    .get_mut(recipient_channel)?
                    .register_inbound(data.len() as u32)?;
                self.replenish(recipient_channel, grant).await?;
                if data_type != EXTENDED_DATA_STDERR {
                    tracing::debug!(data_type, "non-stderr extended data");
                }
                self.emit(
                    recipient_channel,
                    ChannelEvent::ExtendedData { data_type, data },
                )
                .await;
            }
            Message::ChannelEof { recipient_channel } => {
                self.mux.get_mut(recipient_channel)?.note_eof_received();
                self.emit(recipient_channel, ChannelEvent::Eof).await;
            }
            Message::ChannelClose { recipient_channel } => {
                let state = self.mux.get_mut(recipient_channel)?;
                state.note_close_received();
                // Whatever the window still permits goes out before we
                // acknowledge the close
                self.flush_channel(recipient_channel).await?;
                self.send_close(recipient_channel).await?;
                self.reap_if_closed(recipient_channel).await;
            }
            Message::ChannelRequest {
                recipient_channel,
                want_reply,
                request,
            } => {
                let remote_id = self.remote_id(recipient_channel)?;
                match request {
                    ChannelRequestKind::ExitStatus { status } => {
                        self.emit(recipient_channel, ChannelEvent::ExitStatus(status))
                            .await;
                    }
                    ChannelRequestKind::ExitSignal { signal, .. } => {
                        self.emit(recipient_channel, ChannelEvent::ExitSignal { signal })
                            .await;
                    }
                    other => {
                        tracing::debug!(request = other.name(), "unhandled channel request");
                        if want_reply {
                            self.transport
                                .send(Message::ChannelFailure {
                                    recipient_channel: remote_id,
                                })
                                .await?;
                        }
                    }
                }
            }
            Message::ChannelSuccess { recipient_channel } => {
                tracing::debug!(channel = recipient_channel, "channel request accepted");
            }
            Message::ChannelFailure { recipient_channel } => {
                // The shell/exec request itself was refused; the
                // channel is useless, close it
                tracing::warn!(channel = recipient_channel, "channel request refused");
                self.send_close(recipient_channel).await?;
                self.reap_if_closed(recipient_channel).await;
            }
            Message::GlobalRequest {
                name, want_reply, ..
            } => {
                tracing::debug!(request = %name, "global request ignored");
                if want_reply {
                    self.transport.send(Message::RequestFailure).await?;
                }
            }
            Message::KexInit(peer_init) => {
                // Server-initiated re-key; channel callers never notice
                let deferred = kex::run(
                    &mut self.transport,
                    &self.host,
                    self.port,
                    &self.verifier,
                    Some(peer_init),
                )
                .await?;
                self.deferred.extend(deferred);
                self.flush_all().await?;
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected message: {:?}",
                    other.message_type()
                )));
            }
        }
        Ok(())
    }

    fn remote_id(&mut self, local_id: u32) -> Result<u32, Error> {
        self.mux
            .get_mut(local_id)?
            .remote_id()
            .ok_or_else(|| Error::ProtocolViolation("message for unconfirmed channel".into()))
    }

    /// Send whatever the remote window currently permits
    async fn flush_channel(&mut self, local_id: u32) -> Result<(), Error> {
        let state = self.mux.get_mut(local_id)?;
        let Some(remote_id) = state.remote_id() else {
            return Ok(());
        };
        let chunks = state.take_sendable();
        for chunk in chunks {
            self.transport
                .send(Message::ChannelData {
                    recipient_channel: remote_id,
                    data: chunk,
                })
                .await?;
        }
        Ok(())
    }

    async fn flush_all(&mut self) -> Result<(), Error> {
        for id in self.mux.ids() {
            self.flush_channel(id).await?;
        }
        Ok(())
    }

    /// Send EOF and CLOSE once each, in order
    async fn send_close(&mut self, local_id: u32) -> Result<(), Error> {
        let state = self.mux.get_mut(local_id)?;
        let Some(remote_id) = state.remote_id() else {
            return Ok(());
        };
        if !state.eof_sent() {
            state.note_eof_sent();
            self.transport
                .send(Message::ChannelEof {
                    recipient_channel: remote_id,
                })
                .await?;
        }
        let state = self.mux.get_mut(local_id)?;
        if !state.close_sent() {
            state.note_close_sent();
            self.transport
                .send(Message::ChannelClose {
                    recipient_channel: remote_id,
                })
                .await?;
        }
        Ok(())
    }

    /// Drop a channel once both directions have closed
    async fn reap_if_closed(&mut self, local_id: u32) {
        let fully_closed = self
            .mux
            .get(local_id)
            .is_some_and(ChannelState::is_fully_closed);
        if fully_closed {
            self.emit(local_id, ChannelEvent::Closed).await;
            self.mux.remove(local_id);
            self.plumbing.remove(&local_id);
            tracing::debug!(channel = local_id, "channel closed");
        }
    }

    async fn replenish(&mut self, local_id: u32, grant: Option<u32>) -> Result<(), Error> {
        if let Some(additional_bytes) = grant {
            let remote_id = self.remote_id(local_id)?;
            self.transport
                .send(Message::ChannelWindowAdjust {
                    recipient_channel: remote_id,
                    additional_bytes,
                })
                .await?;
        }
        Ok(())
    }

    async fn emit(&mut self, local_id: u32, event: ChannelEvent) {
        if let Some(plumbing) = self.plumbing.get(&local_id) {
            // Receiver gone means the caller dropped the handle
            let _ = plumbing.event_tx.send(event).await;
        }
    }

    /// Resolve every pending operation with the terminal outcome
    async fn fail_all(&mut self) {
        self.transport.set_state(TransportState::Closed);
        for (_, plumbing) in self.plumbing.drain() {
            if let Some(pending) = plumbing.pending {
                let _ = pending.reply.send(Err(Error::ConnectionClosed));
            }
            // Dropping event_tx ends the event stream. Connection loss
            // deliberately does not synthesize a `Closed` event, so a
            // bare end-of-stream marks a dead connection while `Closed`
            // followed by end-of-stream marks an orderly close.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_debug_without_internals() {
        let (command_tx, _command_rx) = mpsc::channel(1);
        let (_event_tx, events) = mpsc::channel(1);

        let channel = Channel {
            id: ChannelId::new(3),
            command_tx: command_tx.clone(),
            events,
        };
        assert_eq!(format!("{channel:?}"), "Channel { id: ChannelId(3) }");

        let session = Session { command_tx };
        assert_eq!(format!("{session:?}"), "Session");
    }
}
