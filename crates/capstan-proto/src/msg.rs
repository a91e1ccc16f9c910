//! Message types for the SSH-2 client core
//!
//! Numeric codes are the IANA-registered values (RFC 4250 §4.1) so the
//! wire format interoperates with any conforming peer:
//!
//! - 1..=4: transport-generic (disconnect, ignore, unimplemented, debug)
//! - 5..=6: service request/accept
//! - 20..=21, 30..=31: algorithm negotiation and ECDH key exchange
//! - 50..=53, 60: user authentication
//! - 80..=82: global requests
//! - 90..=100: connection protocol (channels)
//!
//! Every message the client core sends or handles has a typed variant;
//! payload encoding follows RFC 4253/4252/4254 field order exactly.

use bytes::{Bytes, BytesMut};

use crate::error::WireError;
use crate::wire;

/// Extended-data stream type for stderr (RFC 4254 §5.2)
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Disconnect reason codes (RFC 4253 §11.1), subset used by the client
pub mod disconnect_reason {
    pub const PROTOCOL_ERROR: u32 = 2;
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    pub const MAC_ERROR: u32 = 5;
    pub const BY_APPLICATION: u32 = 11;
}

/// Channel-open failure reason codes (RFC 4254 §5.1)
pub mod open_failure_reason {
    pub const ADMINISTRATIVELY_PROHIBITED: u32 = 1;
    pub const CONNECT_FAILED: u32 = 2;
    pub const UNKNOWN_CHANNEL_TYPE: u32 = 3;
    pub const RESOURCE_SHORTAGE: u32 = 4;
}

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Disconnect = 1,
    Ignore = 2,
    Unimplemented = 3,
    Debug = 4,
    ServiceRequest = 5,
    ServiceAccept = 6,
    KexInit = 20,
    NewKeys = 21,
    KexEcdhInit = 30,
    KexEcdhReply = 31,
    UserauthRequest = 50,
    UserauthFailure = 51,
    UserauthSuccess = 52,
    UserauthBanner = 53,
    UserauthPkOk = 60,
    GlobalRequest = 80,
    RequestSuccess = 81,
    RequestFailure = 82,
    ChannelOpen = 90,
    ChannelOpenConfirmation = 91,
    ChannelOpenFailure = 92,
    ChannelWindowAdjust = 93,
    ChannelData = 94,
    ChannelExtendedData = 95,
    ChannelEof = 96,
    ChannelClose = 97,
    ChannelRequest = 98,
    ChannelSuccess = 99,
    ChannelFailure = 100,
}

impl MessageType {
    /// Convert to the registered wire value
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from a wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Disconnect),
            2 => Some(Self::Ignore),
            3 => Some(Self::Unimplemented),
            4 => Some(Self::Debug),
            5 => Some(Self::ServiceRequest),
            6 => Some(Self::ServiceAccept),
            20 => Some(Self::KexInit),
            21 => Some(Self::NewKeys),
            30 => Some(Self::KexEcdhInit),
            31 => Some(Self::KexEcdhReply),
            50 => Some(Self::UserauthRequest),
            51 => Some(Self::UserauthFailure),
            52 => Some(Self::UserauthSuccess),
            53 => Some(Self::UserauthBanner),
            60 => Some(Self::UserauthPkOk),
            80 => Some(Self::GlobalRequest),
            81 => Some(Self::RequestSuccess),
            82 => Some(Self::RequestFailure),
            90 => Some(Self::ChannelOpen),
            91 => Some(Self::ChannelOpenConfirmation),
            92 => Some(Self::ChannelOpenFailure),
            93 => Some(Self::ChannelWindowAdjust),
            94 => Some(Self::ChannelData),
            95 => Some(Self::ChannelExtendedData),
            96 => Some(Self::ChannelEof),
            97 => Some(Self::ChannelClose),
            98 => Some(Self::ChannelRequest),
            99 => Some(Self::ChannelSuccess),
            100 => Some(Self::ChannelFailure),
            _ => None,
        }
    }
}

/// Algorithm negotiation payload (SSH_MSG_KEXINIT, RFC 4253 §7.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    pub cookie: [u8; 16],
    pub kex_algorithms: Vec<String>,
    pub server_host_key_algorithms: Vec<String>,
    pub encryption_client_to_server: Vec<String>,
    pub encryption_server_to_client: Vec<String>,
    pub mac_client_to_server: Vec<String>,
    pub mac_server_to_client: Vec<String>,
    pub compression_client_to_server: Vec<String>,
    pub compression_server_to_client: Vec<String>,
    pub languages_client_to_server: Vec<String>,
    pub languages_server_to_client: Vec<String>,
    pub first_kex_packet_follows: bool,
}

impl KexInit {
    fn encode_fields(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(&self.cookie);
        wire::put_name_list(dst, &self.kex_algorithms);
        wire::put_name_list(dst, &self.server_host_key_algorithms);
        wire::put_name_list(dst, &self.encryption_client_to_server);
        wire::put_name_list(dst, &self.encryption_server_to_client);
        wire::put_name_list(dst, &self.mac_client_to_server);
        wire::put_name_list(dst, &self.mac_server_to_client);
        wire::put_name_list(dst, &self.compression_client_to_server);
        wire::put_name_list(dst, &self.compression_server_to_client);
        wire::put_name_list(dst, &self.languages_client_to_server);
        wire::put_name_list(dst, &self.languages_server_to_client);
        wire::put_bool(dst, self.first_kex_packet_follows);
        dst.extend_from_slice(&[0, 0, 0, 0]); // reserved
    }

    fn decode_fields(src: &mut Bytes) -> Result<Self, WireError> {
        if src.len() < 16 {
            return Err(WireError::Truncated);
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&src.split_to(16));

        let init = Self {
            cookie,
            kex_algorithms: wire::get_name_list(src)?,
            server_host_key_algorithms: wire::get_name_list(src)?,
            encryption_client_to_server: wire::get_name_list(src)?,
            encryption_server_to_client: wire::get_name_list(src)?,
            mac_client_to_server: wire::get_name_list(src)?,
            mac_server_to_client: wire::get_name_list(src)?,
            compression_client_to_server: wire::get_name_list(src)?,
            compression_server_to_client: wire::get_name_list(src)?,
            languages_client_to_server: wire::get_name_list(src)?,
            languages_server_to_client: wire::get_name_list(src)?,
            first_kex_packet_follows: wire::get_bool(src)?,
        };
        let _reserved = wire::get_u32(src)?;
        Ok(init)
    }
}

/// Method-specific fields of an authentication request (RFC 4252)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// "none" probe, used to learn the server's method list
    None,
    /// Password authentication (§8); no password-change support
    Password { password: String },
    /// Public-key authentication (§7); `signature` is absent for the
    /// probe request and present for the signed follow-up
    PublicKey {
        algorithm: String,
        public_key_blob: Bytes,
        signature: Option<Bytes>,
    },
}

impl AuthMethod {
    /// Method name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
        }
    }
}

/// Typed requests carried by SSH_MSG_CHANNEL_REQUEST (RFC 4254 §6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestKind {
    /// Request a pseudo-terminal on a session channel
    PtyReq {
        term: String,
        cols: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
        modes: Bytes,
    },
    /// Start the user's default shell
    Shell,
    /// Run a single command
    Exec { command: String },
    /// Remote process exit status (server to client)
    ExitStatus { status: u32 },
    /// Remote process terminated by signal (server to client)
    ExitSignal {
        signal: String,
        core_dumped: bool,
        message: String,
    },
    /// Any request type this core does not interpret
    Other { name: String, data: Bytes },
}

impl ChannelRequestKind {
    /// Request type name as it appears on the wire
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestKind::PtyReq { .. } => "pty-req",
            ChannelRequestKind::Shell => "shell",
            ChannelRequestKind::Exec { .. } => "exec",
            ChannelRequestKind::ExitStatus { .. } => "exit-status",
            ChannelRequestKind::ExitSignal { .. } => "exit-signal",
            ChannelRequestKind::Other { name, .. } => name,
        }
    }
}

/// Protocol messages handled by the client core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Disconnect {
        reason_code: u32,
        description: String,
    },
    Ignore {
        data: Bytes,
    },
    Unimplemented {
        sequence_number: u32,
    },
    Debug {
        always_display: bool,
        message: String,
    },
    ServiceRequest {
        service: String,
    },
    ServiceAccept {
        service: String,
    },
    KexInit(KexInit),
    NewKeys,
    KexEcdhInit {
        client_public: Bytes,
    },
    KexEcdhReply {
        host_key_blob: Bytes,
        server_public: Bytes,
        signature_blob: Bytes,
    },
    UserauthRequest {
        username: String,
        service: String,
        method: AuthMethod,
    },
    UserauthFailure {
        methods_that_can_continue: Vec<String>,
        partial_success: bool,
    },
    UserauthSuccess,
    UserauthBanner {
        message: String,
        language: String,
    },
    UserauthPkOk {
        algorithm: String,
        public_key_blob: Bytes,
    },
    GlobalRequest {
        name: String,
        want_reply: bool,
        data: Bytes,
    },
    RequestSuccess {
        data: Bytes,
    },
    RequestFailure,
    ChannelOpen {
        kind: String,
        sender_channel: u32,
        initial_window: u32,
        max_packet: u32,
        data: Bytes,
    },
    ChannelOpenConfirmation {
        recipient_channel: u32,
        sender_channel: u32,
        initial_window: u32,
        max_packet: u32,
    },
    ChannelOpenFailure {
        recipient_channel: u32,
        reason_code: u32,
        description: String,
        language: String,
    },
    ChannelWindowAdjust {
        recipient_channel: u32,
        additional_bytes: u32,
    },
    ChannelData {
        recipient_channel: u32,
        data: Bytes,
    },
    ChannelExtendedData {
        recipient_channel: u32,
        data_type: u32,
        data: Bytes,
    },
    ChannelEof {
        recipient_channel: u32,
    },
    ChannelClose {
        recipient_channel: u32,
    },
    ChannelRequest {
        recipient_channel: u32,
        want_reply: bool,
        request: ChannelRequestKind,
    },
    ChannelSuccess {
        recipient_channel: u32,
    },
    ChannelFailure {
        recipient_channel: u32,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Disconnect { .. } => MessageType::Disconnect,
            Message::Ignore { .. } => MessageType::Ignore,
            Message::Unimplemented { .. } => MessageType::Unimplemented,
            Message::Debug { .. } => MessageType::Debug,
            Message::ServiceRequest { .. } => MessageType::ServiceRequest,
            Message::ServiceAccept { .. } => MessageType::ServiceAccept,
            Message::KexInit(_) => MessageType::KexInit,
            Message::NewKeys => MessageType::NewKeys,
            Message::KexEcdhInit { .. } => MessageType::KexEcdhInit,
            Message::KexEcdhReply { .. } => MessageType::KexEcdhReply,
            Message::UserauthRequest { .. } => MessageType::UserauthRequest,
            Message::UserauthFailure { .. } => MessageType::UserauthFailure,
            Message::UserauthSuccess => MessageType::UserauthSuccess,
            Message::UserauthBanner { .. } => MessageType::UserauthBanner,
            Message::UserauthPkOk { .. } => MessageType::UserauthPkOk,
            Message::GlobalRequest { .. } => MessageType::GlobalRequest,
            Message::RequestSuccess { .. } => MessageType::RequestSuccess,
            Message::RequestFailure => MessageType::RequestFailure,
            Message::ChannelOpen { .. } => MessageType::ChannelOpen,
            Message::ChannelOpenConfirmation { .. } => MessageType::ChannelOpenConfirmation,
            Message::ChannelOpenFailure { .. } => MessageType::ChannelOpenFailure,
            Message::ChannelWindowAdjust { .. } => MessageType::ChannelWindowAdjust,
            Message::ChannelData { .. } => MessageType::ChannelData,
            Message::ChannelExtendedData { .. } => MessageType::ChannelExtendedData,
            Message::ChannelEof { .. } => MessageType::ChannelEof,
            Message::ChannelClose { .. } => MessageType::ChannelClose,
            Message::ChannelRequest { .. } => MessageType::ChannelRequest,
            Message::ChannelSuccess { .. } => MessageType::ChannelSuccess,
            Message::ChannelFailure { .. } => MessageType::ChannelFailure,
        }
    }

    /// Encode this message into a packet payload (type byte + fields)
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(64);
        dst.extend_from_slice(&[self.message_type().as_u8()]);

        match self {
            Message::Disconnect {
                reason_code,
                description,
            } => {
                dst.extend_from_slice(&reason_code.to_be_bytes());
                wire::put_str(dst, description);
                wire::put_str(dst, ""); // language tag
            }
            Message::Ignore { data } => {
                wire::put_string(dst, data);
            }
            Message::Unimplemented { sequence_number } => {
                dst.extend_from_slice(&sequence_number.to_be_bytes());
            }
            Message::Debug {
                always_display,
                message,
            } => {
                wire::put_bool(dst, *always_display);
                wire::put_str(dst, message);
                wire::put_str(dst, "");
            }
            Message::ServiceRequest { service } => {
                wire::put_str(dst, service);
            }
            Message::ServiceAccept { service } => {
                wire::put_str(dst, service);
            }
            Message::KexInit(init) => {
                init.encode_fields(dst);
            }
            Message::NewKeys => {}
            Message::KexEcdhInit { client_public } => {
                wire::put_string(dst, client_public);
            }
            Message::KexEcdhReply {
                host_key_blob,
                server_public,
                signature_blob,
            } => {
                wire::put_string(dst, host_key_blob);
                wire::put_string(dst, server_public);
                wire::put_string(dst, signature_blob);
            }
            Message::UserauthRequest {
                username,
                service,
                method,
            } => {
                wire::put_str(dst, username);
                wire::put_str(dst, service);
                wire::put_str(dst, method.name());
                match method {
                    AuthMethod::None => {}
                    AuthMethod::Password { password } => {
                        wire::put_bool(dst, false);
                        wire::put_str(dst, password);
                    }
                    AuthMethod::PublicKey {
                        algorithm,
                        public_key_blob,
                        signature,
                    } => {
                        wire::put_bool(dst, signature.is_some());
                        wire::put_str(dst, algorithm);
                        wire::put_string(dst, public_key_blob);
                        if let Some(sig) = signature {
                            wire::put_string(dst, sig);
                        }
                    }
                }
            }
            Message::UserauthFailure {
                methods_that_can_continue,
                partial_success,
            } => {
                wire::put_name_list(dst, methods_that_can_continue);
                wire::put_bool(dst, *partial_success);
            }
            Message::UserauthSuccess => {}
            Message::UserauthBanner { message, language } => {
                wire::put_str(dst, message);
                wire::put_str(dst, language);
            }
            Message::UserauthPkOk {
                algorithm,
                public_key_blob,
            } => {
                wire::put_str(dst, algorithm);
                wire::put_string(dst, public_key_blob);
            }
            Message::GlobalRequest {
                name,
                want_reply,
                data,
            } => {
                wire::put_str(dst, name);
                wire::put_bool(dst, *want_reply);
                dst.extend_from_slice(data);
            }
            Message::RequestSuccess { data } => {
                dst.extend_from_slice(data);
            }
            Message::RequestFailure => {}
            Message::ChannelOpen {
                kind,
                sender_channel,
                initial_window,
                max_packet,
                data,
            } => {
                wire::put_str(dst, kind);
                dst.extend_from_slice(&sender_channel.to_be_bytes());
                dst.extend_from_slice(&initial_window.to_be_bytes());
                dst.extend_from_slice(&max_packet.to_be_bytes());
                dst.extend_from_slice(data);
            }
            Message::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window,
                max_packet,
            } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
                dst.extend_from_slice(&sender_channel.to_be_bytes());
                dst.extend_from_slice(&initial_window.to_be_bytes());
                dst.extend_from_slice(&max_packet.to_be_bytes());
            }
            Message::ChannelOpenFailure {
                recipient_channel,
                reason_code,
                description,
                language,
            } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
                dst.extend_from_slice(&reason_code.to_be_bytes());
                wire::put_str(dst, description);
                wire::put_str(dst, language);
            }
            Message::ChannelWindowAdjust {
                recipient_channel,
                additional_bytes,
            } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
                dst.extend_from_slice(&additional_bytes.to_be_bytes());
            }
            Message::ChannelData {
                recipient_channel,
                data,
            } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
                wire::put_string(dst, data);
            }
            Message::ChannelExtendedData {
                recipient_channel,
                data_type,
                data,
            } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
                dst.extend_from_slice(&data_type.to_be_bytes());
                wire::put_string(dst, data);
            }
            Message::ChannelEof { recipient_channel } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
            }
            Message::ChannelClose { recipient_channel } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
            }
            Message::ChannelRequest {
                recipient_channel,
                want_reply,
                request,
            } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
                wire::put_str(dst, request.name());
                wire::put_bool(dst, *want_reply);
                match request {
                    ChannelRequestKind::PtyReq {
                        term,
                        cols,
                        rows,
                        width_px,
                        height_px,
                        modes,
                    } => {
                        wire::put_str(dst, term);
                        dst.extend_from_slice(&cols.to_be_bytes());
                        dst.extend_from_slice(&rows.to_be_bytes());
                        dst.extend_from_slice(&width_px.to_be_bytes());
                        dst.extend_from_slice(&height_px.to_be_bytes());
                        wire::put_string(dst, modes);
                    }
                    ChannelRequestKind::Shell => {}
                    ChannelRequestKind::Exec { command } => {
                        wire::put_str(dst, command);
                    }
                    ChannelRequestKind::ExitStatus { status } => {
                        dst.extend_from_slice(&status.to_be_bytes());
                    }
                    ChannelRequestKind::ExitSignal {
                        signal,
                        core_dumped,
                        message,
                    } => {
                        wire::put_str(dst, signal);
                        wire::put_bool(dst, *core_dumped);
                        wire::put_str(dst, message);
                        wire::put_str(dst, "");
                    }
                    ChannelRequestKind::Other { data, .. } => {
                        dst.extend_from_slice(data);
                    }
                }
            }
            Message::ChannelSuccess { recipient_channel } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
            }
            Message::ChannelFailure { recipient_channel } => {
                dst.extend_from_slice(&recipient_channel.to_be_bytes());
            }
        }
    }

    /// Encode into a fresh payload buffer
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a message from a packet payload
    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        let type_byte = wire::get_u8(&mut payload)?;
        let message_type =
            MessageType::from_u8(type_byte).ok_or(WireError::UnknownMessageType(type_byte))?;
        let src = &mut payload;

        let message = match message_type {
            MessageType::Disconnect => {
                let reason_code = wire::get_u32(src)?;
                let description = wire::get_str(src)?;
                let _language = wire::get_str(src)?;
                Message::Disconnect {
                    reason_code,
                    description,
                }
            }
            MessageType::Ignore => Message::Ignore {
                data: wire::get_string(src)?,
            },
            MessageType::Unimplemented => Message::Unimplemented {
                sequence_number: wire::get_u32(src)?,
            },
            MessageType::Debug => {
                let always_display = wire::get_bool(src)?;
                let message = wire::get_str(src)?;
                let _language = wire::get_str(src)?;
                Message::Debug {
                    always_display,
                    message,
                }
            }
            MessageType::ServiceRequest => Message::ServiceRequest {
                service: wire::get_str(src)?,
            },
            MessageType::ServiceAccept => Message::ServiceAccept {
                service: wire::get_str(src)?,
            },
            MessageType::KexInit => Message::KexInit(KexInit::decode_fields(src)?),
            MessageType::NewKeys => Message::NewKeys,
            MessageType::KexEcdhInit => Message::KexEcdhInit {
                client_public: wire::get_string(src)?,
            },
            MessageType::KexEcdhReply => Message::KexEcdhReply {
                host_key_blob: wire::get_string(src)?,
                server_public: wire::get_string(src)?,
                signature_blob: wire::get_string(src)?,
            },
            MessageType::UserauthRequest => {
                let username = wire::get_str(src)?;
                let service = wire::get_str(src)?;
                let method_name = wire::get_str(src)?;
                let method = match method_name.as_str() {
                    "none" => AuthMethod::None,
                    "password" => {
                        let _change = wire::get_bool(src)?;
                        AuthMethod::Password {
                            password: wire::get_str(src)?,
                        }
                    }
                    "publickey" => {
                        let signed = wire::get_bool(src)?;
                        let algorithm = wire::get_str(src)?;
                        let public_key_blob = wire::get_string(src)?;
                        let signature = if signed {
                            Some(wire::get_string(src)?)
                        } else {
                            None
                        };
                        AuthMethod::PublicKey {
                            algorithm,
                            public_key_blob,
                            signature,
                        }
                    }
                    _ => return Err(WireError::MalformedPacket("unsupported auth method")),
                };
                Message::UserauthRequest {
                    username,
                    service,
                    method,
                }
            }
            MessageType::UserauthFailure => Message::UserauthFailure {
                methods_that_can_continue: wire::get_name_list(src)?,
                partial_success: wire::get_bool(src)?,
            },
            MessageType::UserauthSuccess => Message::UserauthSuccess,
            MessageType::UserauthBanner => Message::UserauthBanner {
                message: wire::get_str(src)?,
                language: wire::get_str(src)?,
            },
            MessageType::UserauthPkOk => Message::UserauthPkOk {
                algorithm: wire::get_str(src)?,
                public_key_blob: wire::get_string(src)?,
            },
            MessageType::GlobalRequest => {
                let name = wire::get_str(src)?;
                let want_reply = wire::get_bool(src)?;
                let data = src.split_to(src.len());
                Message::GlobalRequest {
                    name,
                    want_reply,
                    data,
                }
            }
            MessageType::RequestSuccess => Message::RequestSuccess {
                data: src.split_to(src.len()),
            },
            MessageType::RequestFailure => Message::RequestFailure,
            MessageType::ChannelOpen => {
                let kind = wire::get_str(src)?;
                let sender_channel = wire::get_u32(src)?;
                let initial_window = wire::get_u32(src)?;
                let max_packet = wire::get_u32(src)?;
                let data = src.split_to(src.len());
                Message::ChannelOpen {
                    kind,
                    sender_channel,
                    initial_window,
                    max_packet,
                    data,
                }
            }
            MessageType::ChannelOpenConfirmation => Message::ChannelOpenConfirmation {
                recipient_channel: wire::get_u32(src)?,
                sender_channel: wire::get_u32(src)?,
                initial_window: wire::get_u32(src)?,
                max_packet: wire::get_u32(src)?,
            },
            MessageType::ChannelOpenFailure => Message::ChannelOpenFailure {
                recipient_channel: wire::get_u32(src)?,
                reason_code: wire::get_u32(src)?,
                description: wire::get_str(src)?,
                language: wire::get_str(src)?,
            },
            MessageType::ChannelWindowAdjust => Message::ChannelWindowAdjust {
                recipient_channel: wire::get_u32(src)?,
                additional_bytes: wire::get_u32(src)?,
            },
            MessageType::ChannelData => Message::ChannelData {
                recipient_channel: wire::get_u32(src)?,
                data: wire::get_string(src)?,
            },
            MessageType::ChannelExtendedData => Message::ChannelExtendedData {
                recipient_channel: wire::get_u32(src)?,
                data_type: wire::get_u32(src)?,
                data: wire::get_string(src)?,
            },
            MessageType::ChannelEof => Message::ChannelEof {
                recipient_channel: wire::get_u32(src)?,
            },
            MessageType::ChannelClose => Message::ChannelClose {
                recipient_channel: wire::get_u32(src)?,
            },
            MessageType::ChannelRequest => {
                let recipient_channel = wire::get_u32(src)?;
                let name = wire::get_str(src)?;
                let want_reply = wire::get_bool(src)?;
                let request = match name.as_str() {
                    "pty-req" => ChannelRequestKind::PtyReq {
                        term: wire::get_str(src)?,
                        cols: wire::get_u32(src)?,
                        rows: wire::get_u32(src)?,
                        width_px: wire::get_u32(src)?,
                        height_px: wire::get_u32(src)?,
                        modes: wire::get_string(src)?,
                    },
                    "shell" => ChannelRequestKind::Shell,
                    "exec" => ChannelRequestKind::Exec {
                        command: wire::get_str(src)?,
                    },
                    "exit-status" => ChannelRequestKind::ExitStatus {
                        status: wire::get_u32(src)?,
                    },
                    "exit-signal" => {
                        let signal = wire::get_str(src)?;
                        let core_dumped = wire::get_bool(src)?;
                        let message = wire::get_str(src)?;
                        let _language = wire::get_str(src)?;
                        ChannelRequestKind::ExitSignal {
                            signal,
                            core_dumped,
                            message,
                        }
                    }
                    _ => ChannelRequestKind::Other {
                        name,
                        data: src.split_to(src.len()),
                    },
                };
                Message::ChannelRequest {
                    recipient_channel,
                    want_reply,
                    request,
                }
            }
            MessageType::ChannelSuccess => Message::ChannelSuccess {
                recipient_channel: wire::get_u32(src)?,
            },
            MessageType::ChannelFailure => Message::ChannelFailure {
                recipient_channel: wire::get_u32(src)?,
            },
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        Message::decode(message.to_payload()).unwrap()
    }

    #[test]
    fn test_message_type_registered_values() {
        // The registered values must survive as_u8/from_u8 exactly
        for (byte, expected) in [
            (1u8, MessageType::Disconnect),
            (20, MessageType::KexInit),
            (21, MessageType::NewKeys),
            (30, MessageType::KexEcdhInit),
            (31, MessageType::KexEcdhReply),
            (50, MessageType::UserauthRequest),
            (51, MessageType::UserauthFailure),
            (52, MessageType::UserauthSuccess),
            (60, MessageType::UserauthPkOk),
            (90, MessageType::ChannelOpen),
            (93, MessageType::ChannelWindowAdjust),
            (94, MessageType::ChannelData),
            (95, MessageType::ChannelExtendedData),
            (97, MessageType::ChannelClose),
        ] {
            assert_eq!(MessageType::from_u8(byte), Some(expected));
            assert_eq!(expected.as_u8(), byte);
        }
    }

    #[test]
    fn test_unknown_message_type() {
        let payload = Bytes::from_static(&[200, 0, 0]);
        assert!(matches!(
            Message::decode(payload),
            Err(WireError::UnknownMessageType(200))
        ));
    }

    #[test]
    fn test_kexinit_roundtrip() {
        let init = KexInit {
            cookie: [7u8; 16],
            kex_algorithms: vec!["curve25519-sha256".into()],
            server_host_key_algorithms: vec!["ssh-ed25519".into()],
            encryption_client_to_server: vec!["aes128-ctr".into()],
            encryption_server_to_client: vec!["aes128-ctr".into()],
            mac_client_to_server: vec!["hmac-sha2-256".into()],
            mac_server_to_client: vec!["hmac-sha2-256".into()],
            compression_client_to_server: vec!["none".into()],
            compression_server_to_client: vec!["none".into()],
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        };

        let decoded = roundtrip(Message::KexInit(init.clone()));
        assert_eq!(decoded, Message::KexInit(init));
    }

    #[test]
    fn test_kexinit_reencode_is_identical() {
        // Exchange-hash computation re-encodes the peer's KEXINIT, so
        // decode followed by encode must reproduce the payload exactly.
        let init = KexInit {
            cookie: [0xAB; 16],
            kex_algorithms: vec!["curve25519-sha256".into(), "ext-info-c".into()],
            server_host_key_algorithms: vec!["ssh-ed25519".into()],
            encryption_client_to_server: vec!["aes128-ctr".into()],
            encryption_server_to_client: vec!["aes128-ctr".into()],
            mac_client_to_server: vec!["hmac-sha2-256".into()],
            mac_server_to_client: vec!["hmac-sha2-256".into()],
            compression_client_to_server: vec!["none".into()],
            compression_server_to_client: vec!["none".into()],
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        };

        let payload = Message::KexInit(init).to_payload();
        let decoded = Message::decode(payload.clone()).unwrap();
        assert_eq!(decoded.to_payload(), payload);
    }

    #[test]
    fn test_userauth_password_roundtrip() {
        let message = Message::UserauthRequest {
            username: "vista".into(),
            service: "ssh-connection".into(),
            method: AuthMethod::Password {
                password: "secret".into(),
            },
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_userauth_publickey_probe_and_signed() {
        let probe = Message::UserauthRequest {
            username: "vista".into(),
            service: "ssh-connection".into(),
            method: AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".into(),
                public_key_blob: Bytes::from_static(&[1, 2, 3]),
                signature: None,
            },
        };
        assert_eq!(roundtrip(probe.clone()), probe);

        let signed = Message::UserauthRequest {
            username: "vista".into(),
            service: "ssh-connection".into(),
            method: AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".into(),
                public_key_blob: Bytes::from_static(&[1, 2, 3]),
                signature: Some(Bytes::from_static(&[9, 9])),
            },
        };
        assert_eq!(roundtrip(signed.clone()), signed);
    }

    #[test]
    fn test_channel_messages_roundtrip() {
        for message in [
            Message::ChannelOpen {
                kind: "session".into(),
                sender_channel: 0,
                initial_window: 2 * 1024 * 1024,
                max_packet: 32768,
                data: Bytes::new(),
            },
            Message::ChannelWindowAdjust {
                recipient_channel: 3,
                additional_bytes: 4096,
            },
            Message::ChannelData {
                recipient_channel: 3,
                data: Bytes::from_static(b"echo hi\n"),
            },
            Message::ChannelExtendedData {
                recipient_channel: 3,
                data_type: EXTENDED_DATA_STDERR,
                data: Bytes::from_static(b"oops\n"),
            },
            Message::ChannelEof {
                recipient_channel: 3,
            },
            Message::ChannelClose {
                recipient_channel: 3,
            },
        ] {
            assert_eq!(roundtrip(message.clone()), message);
        }
    }

    #[test]
    fn test_channel_request_roundtrip() {
        let message = Message::ChannelRequest {
            recipient_channel: 1,
            want_reply: true,
            request: ChannelRequestKind::PtyReq {
                term: "xterm-256color".into(),
                cols: 80,
                rows: 24,
                width_px: 0,
                height_px: 0,
                modes: Bytes::from_static(&[0]),
            },
        };
        assert_eq!(roundtrip(message.clone()), message);

        let exit = Message::ChannelRequest {
            recipient_channel: 1,
            want_reply: false,
            request: ChannelRequestKind::ExitStatus { status: 0 },
        };
        assert_eq!(roundtrip(exit.clone()), exit);
    }

    #[test]
    fn test_truncated_payload() {
        let payload = Message::ChannelData {
            recipient_channel: 1,
            data: Bytes::from_static(b"hello"),
        }
        .to_payload();

        let truncated = payload.slice(..payload.len() - 2);
        assert!(matches!(
            Message::decode(truncated),
            Err(WireError::Truncated)
        ));
    }
}
