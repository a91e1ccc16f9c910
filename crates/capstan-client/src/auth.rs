//! User authentication (RFC 4252)
//!
//! Runs strictly between key establishment and the first channel open.
//! Credentials are attempted in caller order, one in flight at a time;
//! a rejected credential is never resubmitted (the iteration structure
//! guarantees it). Public-key attempts probe first and only sign once
//! the server answers PK_OK for that key.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use capstan_core::{Credential, Error};
use capstan_proto::{wire, AuthMethod, Message, MessageType};

use crate::transport::Transport;

/// Service name requested before authentication begins
const USERAUTH_SERVICE: &str = "ssh-userauth";
/// Service every auth request asks to reach
const CONNECTION_SERVICE: &str = "ssh-connection";

/// Progress of the authentication phase; exists only while it runs
#[derive(Debug, Default)]
struct AuthState {
    /// Method names attempted so far, in order
    attempted: Vec<&'static str>,
    /// The server's most recent methods-that-can-continue list
    remaining: Vec<String>,
}

/// Authenticate `username` with the supplied credentials
///
/// Returns `AuthExhausted` carrying the server's last-advertised method
/// list when every credential is rejected.
pub async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut Transport<S>,
    username: &str,
    credentials: &[Credential],
) -> Result<(), Error> {
    transport
        .send(Message::ServiceRequest {
            service: USERAUTH_SERVICE.to_owned(),
        })
        .await?;
    match transport.recv().await? {
        Message::ServiceAccept { service } if service == USERAUTH_SERVICE => {}
        other => {
            return Err(Error::ProtocolViolation(format!(
                "expected SERVICE_ACCEPT for {USERAUTH_SERVICE}, got {:?}",
                other.message_type()
            )))
        }
    }

    let mut state = AuthState::default();

    for credential in credentials {
        state.attempted.push(credential.method_name());
        tracing::debug!(
            username,
            method = credential.method_name(),
            attempt = state.attempted.len(),
            "attempting credential"
        );

        if attempt(transport, username, credential, &mut state).await? {
            tracing::info!(username, method = credential.method_name(), "authenticated");
            return Ok(());
        }
    }

    Err(Error::AuthExhausted {
        remaining_methods: state.remaining,
    })
}

/// Run one credential to success or failure
async fn attempt<S: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut Transport<S>,
    username: &str,
    credential: &Credential,
    state: &mut AuthState,
) -> Result<bool, Error> {
    let request = match credential {
        Credential::Password(password) => Message::UserauthRequest {
            username: username.to_owned(),
            service: CONNECTION_SERVICE.to_owned(),
            method: AuthMethod::Password {
                password: password.clone(),
            },
        },
        Credential::Ed25519(_) => {
            let blob = credential
                .public_key_blob()
                .unwrap_or_else(|| unreachable!("key credentials always have a blob"));
            Message::UserauthRequest {
                username: username.to_owned(),
                service: CONNECTION_SERVICE.to_owned(),
                method: AuthMethod::PublicKey {
                    algorithm: capstan_core::auth::SSH_ED25519.to_owned(),
                    public_key_blob: blob,
                    signature: None,
                },
            }
        }
    };
    transport.send(request).await?;

    loop {
        match transport.recv().await? {
            Message::UserauthSuccess => return Ok(true),
            Message::UserauthFailure {
                methods_that_can_continue,
                partial_success,
            } => {
                tracing::debug!(
                    methods = ?methods_that_can_continue,
                    partial_success,
                    "credential rejected"
                );
                state.remaining = methods_that_can_continue;
                return Ok(false);
            }
            Message::UserauthBanner { message, .. } => {
                // Informational only; shown in logs, never an event
                tracing::info!(banner = %message, "server banner");
            }
            Message::UserauthPkOk { .. } => match credential {
                Credential::Ed25519(_) => {
                    let signed = signed_request(transport, username, credential)?;
                    transport.send(signed).await?;
                }
                Credential::Password(_) => {
                    return Err(Error::ProtocolViolation(
                        "PK_OK for a password attempt".into(),
                    ))
                }
            },
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected message during authentication: {:?}",
                    other.message_type()
                )))
            }
        }
    }
}

/// Build the signed follow-up to a PK_OK continuation
///
/// The signature covers the session id plus the request fields up to
/// and including the key blob, with the has-signature flag set (RFC
/// 4252 §7).
fn signed_request<S: AsyncRead + AsyncWrite + Unpin>(
    transport: &Transport<S>,
    username: &str,
    credential: &Credential,
) -> Result<Message, Error> {
    let session_id = transport
        .session_id()
        .ok_or_else(|| Error::ProtocolViolation("authentication before key exchange".into()))?;
    let blob = credential
        .public_key_blob()
        .unwrap_or_else(|| unreachable!("key credentials always have a blob"));

    let mut to_sign = BytesMut::new();
    wire::put_string(&mut to_sign, session_id);
    to_sign.extend_from_slice(&[MessageType::UserauthRequest.as_u8()]);
    wire::put_str(&mut to_sign, username);
    wire::put_str(&mut to_sign, CONNECTION_SERVICE);
    wire::put_str(&mut to_sign, "publickey");
    wire::put_bool(&mut to_sign, true);
    wire::put_str(&mut to_sign, capstan_core::auth::SSH_ED25519);
    wire::put_string(&mut to_sign, &blob);

    let signature = credential
        .sign(&to_sign)
        .unwrap_or_else(|| unreachable!("key credentials can sign"));

    Ok(Message::UserauthRequest {
        username: username.to_owned(),
        service: CONNECTION_SERVICE.to_owned(),
        method: AuthMethod::PublicKey {
            algorithm: capstan_core::auth::SSH_ED25519.to_owned(),
            public_key_blob: blob,
            signature: Some(signature),
        },
    })
}
