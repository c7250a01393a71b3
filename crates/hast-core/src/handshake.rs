//! Peer handshake.
//!
//! A session is two TCP connections opened by the primary. The first carries
//! a header without a token; the secondary answers with a fresh token. The
//! second carries that token back, which lets the secondary pair the two
//! legs even when a stale half-open connection from an earlier session is
//! still around. The accepting side lives in the daemon; this module holds
//! the connecting side and the shared error type.

use crate::message::{HandshakeHeader, HandshakeReply, MessageError, recv_message, send_message};
use crate::token::Token;
use crate::transport::Conn;
use crate::worker::WorkerError;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("connection from unauthorized address {0}")]
    UnknownPeer(String),

    #[error("No resource {0} configured.")]
    NoSuchResource(String),

    #[error("Resource {0} is not configured as secondary.")]
    RoleMismatch(String),

    #[error("Peer {peer} is not authorized for resource {resource}.")]
    PeerMismatch { resource: String, peer: String },

    #[error("Token mismatch.")]
    TokenMismatch,

    #[error("Initial connection not established.")]
    NoInboundLeg,

    #[error("Worker process already running.")]
    SessionActive,

    #[error("peer refused handshake: {0}")]
    Refused(String),

    #[error("peer reply carried no token")]
    MissingToken,

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Run one leg of the handshake from the connecting side.
///
/// Without `token` this opens a new session and returns the token the
/// secondary issued. With it, the second leg is attached and the echoed
/// token is checked against `token`.
pub async fn client_leg(
    conn: &mut Conn,
    resource: &str,
    token: Option<&Token>,
) -> Result<Token, HandshakeError> {
    let header = HandshakeHeader {
        resource: resource.to_string(),
        token: token.cloned(),
    };
    send_message(conn, &header).await?;

    let reply: HandshakeReply = recv_message(conn).await?;
    if let Some(errmsg) = reply.errmsg {
        return Err(HandshakeError::Refused(errmsg));
    }
    let issued = reply.token.ok_or(HandshakeError::MissingToken)?;
    if token.is_some_and(|expected| *expected != issued) {
        return Err(HandshakeError::TokenMismatch);
    }
    Ok(issued)
}
