//! Local control socket protocol and client.
//!
//! Administrative commands reach the daemon over its control address, one
//! request and one reply per connection, using the same framing as every
//! other channel.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::{MessageError, recv_message, send_message};
use crate::resource::{ResourceStatus, Role};
use crate::transport::{Registry, Timeout, TransportError};

/// Default time allowed for a control round-trip.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(20);

/// Request sent to the daemon. An empty `names` list means every resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlRequest {
    Status {
        #[serde(default)]
        names: Vec<String>,
    },
    SetRole {
        #[serde(default)]
        names: Vec<String>,
        role: Role,
    },
}

/// Daemon's answer. `error` is zero on success, an errno otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub error: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceStatus>,
}

impl ControlReply {
    pub fn ok(resources: Vec<ResourceStatus>) -> Self {
        Self {
            error: 0,
            errmsg: None,
            resources,
        }
    }

    pub fn failed(error: i32, errmsg: impl Into<String>, resources: Vec<ResourceStatus>) -> Self {
        Self {
            error,
            errmsg: Some(errmsg.into()),
            resources,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unable to reach daemon: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("daemon reported error {error}: {errmsg}")]
    Daemon { error: i32, errmsg: String },
}

/// Client for the daemon's control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    registry: Registry,
    addr: String,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            registry: Registry::new(),
            addr: addr.into(),
            timeout: DEFAULT_CONTROL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Status of `names`, or of every resource when empty.
    pub async fn status(&self, names: &[String]) -> Result<Vec<ResourceStatus>, ControlError> {
        let reply = self
            .request(&ControlRequest::Status {
                names: names.to_vec(),
            })
            .await?;
        Ok(reply.resources)
    }

    /// Change the role of `names`, or of every resource when empty.
    pub async fn set_role(
        &self,
        names: &[String],
        role: Role,
    ) -> Result<Vec<ResourceStatus>, ControlError> {
        let reply = self
            .request(&ControlRequest::SetRole {
                names: names.to_vec(),
                role,
            })
            .await?;
        Ok(reply.resources)
    }

    async fn request(&self, request: &ControlRequest) -> Result<ControlReply, ControlError> {
        let mut conn = self.registry.client(&self.addr)?;
        conn.connect(Timeout::Secs(self.timeout.as_secs().max(1)))
            .await?;
        conn.set_timeout(Some(self.timeout));
        send_message(&mut conn, request).await?;
        let reply: ControlReply = recv_message(&mut conn).await?;
        conn.close();

        if reply.error != 0 {
            return Err(ControlError::Daemon {
                error: reply.error,
                errmsg: reply.errmsg.unwrap_or_default(),
            });
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_wire_form() {
        let json = serde_json::to_value(ControlRequest::SetRole {
            names: vec!["r0".into()],
            role: Role::Primary,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "cmd": "set-role", "names": ["r0"], "role": "primary" })
        );

        let status: ControlRequest = serde_json::from_str(r#"{"cmd":"status"}"#).unwrap();
        assert_eq!(status, ControlRequest::Status { names: vec![] });
    }

    #[tokio::test]
    async fn test_unreachable_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlClient::new(format!("uds://{}/ctl.sock", dir.path().display()))
            .with_timeout(Duration::from_secs(1));
        assert!(matches!(
            client.status(&[]).await,
            Err(ControlError::Transport(_))
        ));
    }
}
