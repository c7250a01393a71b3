//! Wire messages.
//!
//! Every message travels as a 4-byte big-endian length followed by that many
//! bytes of JSON. The same framing is used between peers, between the daemon
//! and its workers, and on the local control socket.

use hast_config::{ReplicationMode, ResourceConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::resource::Role;
use crate::token::Token;
use crate::transport::{Conn, TransportError};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
}

impl MessageError {
    /// Whether the peer went away, as opposed to sending something bad.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Transport(TransportError::NotConnected))
    }
}

/// Encode `msg` and send it as one frame.
pub async fn send_message<T: Serialize + ?Sized>(
    conn: &mut Conn,
    msg: &T,
) -> Result<(), MessageError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(MessageError::TooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    conn.send(&frame).await?;
    Ok(())
}

/// Receive one frame and decode it.
pub async fn recv_message<T: DeserializeOwned>(conn: &mut Conn) -> Result<T, MessageError> {
    let mut header = [0u8; 4];
    conn.recv(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(MessageError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    conn.recv(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// First message on every peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
}

/// Secondary's answer to a [`HandshakeHeader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl HandshakeReply {
    pub fn accepted(token: Token) -> Self {
        Self {
            token: Some(token),
            errmsg: None,
        }
    }

    pub fn refused(errmsg: impl Into<String>) -> Self {
        Self {
            token: None,
            errmsg: Some(errmsg.into()),
        }
    }
}

/// Parameters a freshly spawned worker receives before its channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSetup {
    pub name: String,
    pub role: Role,
    pub local: String,
    pub provider: String,
    pub remote: String,
    pub replication: ReplicationMode,
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
}

impl WorkerSetup {
    pub fn new(config: &ResourceConfig, role: Role) -> Self {
        Self {
            name: config.name.clone(),
            role,
            local: config.local.clone(),
            provider: config.provider().to_string(),
            remote: config.remote.clone(),
            replication: config.replication(),
            timeout: config.timeout_secs(),
            exec: config.exec().map(str::to_string),
        }
    }
}

/// Daemon-to-worker request on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CtrlRequest {
    /// New peer parameters for a running primary worker.
    Reload {
        /// Echoed in the reply; tells a late answer from the current one.
        #[serde(default)]
        seq: u64,
        remoteaddr: String,
        replication: i32,
        timeout: i32,
        exec: String,
    },
}

impl CtrlRequest {
    pub fn reload(config: &ResourceConfig, seq: u64) -> Self {
        Self::Reload {
            seq,
            remoteaddr: config.remote.clone(),
            replication: config.replication().as_i32(),
            timeout: i32::try_from(config.timeout_secs()).unwrap_or(i32::MAX),
            exec: config.exec().unwrap_or_default().to_string(),
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            Self::Reload { seq, .. } => *seq,
        }
    }
}

/// Worker's answer to a [`CtrlRequest`]; zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlReply {
    #[serde(default)]
    pub seq: u64,
    pub error: i16,
}

/// Worker's request for an outbound connection to the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnRequest {}

/// Daemon's answer to a [`ConnRequest`]. On zero a descriptor follows;
/// otherwise `error` is the errno of the failed connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnReply {
    pub error: i32,
}

/// Notification a worker sends over its event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerEvent {
    Connect,
    Disconnect,
    Syncstart,
    Syncdone,
    Syncintr,
    SplitBrain,
}

impl WorkerEvent {
    /// Name passed to the event hook.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Syncstart => "syncstart",
            Self::Syncdone => "syncdone",
            Self::Syncintr => "syncintr",
            Self::SplitBrain => "split-brain",
        }
    }
}

impl std::fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
