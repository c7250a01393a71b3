//! Per-resource runtime state owned by the control daemon.

use std::fmt;
use std::str::FromStr;

use hast_config::{ReplicationMode, ResourceConfig};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::token::Token;
use crate::transport::Conn;
use crate::worker::WorkerHandle;

/// Replication role of a resource on this node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Not replicating; no worker runs.
    #[default]
    Init,
    /// Serves local consumers and replicates to the peer.
    Primary,
    /// Receives replicated writes from the peer.
    Secondary,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "init" => Ok(Self::Init),
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A configured resource and everything the daemon holds for it.
///
/// Peer sockets and the worker handle are owned here; replacing or clearing
/// one closes the previous occupant, so no descriptor is ever held twice.
///
/// Local storage is not. The worker opens `config().local` itself and keeps
/// the descriptor and the provider's size for as long as it runs; the daemon
/// only knows the path.
#[derive(Debug)]
pub struct Resource {
    config: ResourceConfig,
    role: Role,
    previous_role: Role,
    token: Option<Token>,
    local_count: u64,
    remote_count: u64,
    worker: Option<WorkerHandle>,
    remote_in: Option<Conn>,
    remote_out: Option<Conn>,
}

impl Resource {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            config,
            role: Role::Init,
            previous_role: Role::Init,
            token: None,
            local_count: 0,
            remote_count: 0,
            worker: None,
            remote_in: None,
            remote_out: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn previous_role(&self) -> Role {
        self.previous_role
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn worker_pid(&self) -> Option<Pid> {
        self.worker.as_ref().map(WorkerHandle::pid)
    }

    pub fn has_remote_in(&self) -> bool {
        self.remote_in.is_some()
    }

    pub fn has_remote_out(&self) -> bool {
        self.remote_out.is_some()
    }

    /// Local and remote modification counters. They live in on-disk
    /// metadata the daemon does not manage, so they stay at zero here.
    pub fn counters(&self) -> (u64, u64) {
        (self.local_count, self.remote_count)
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        self.previous_role = self.role;
        self.role = role;
    }

    pub(crate) fn replace_config(&mut self, config: ResourceConfig) {
        self.config = config;
    }

    /// Replace the session token with a fresh one and return a copy.
    pub(crate) fn issue_token(&mut self) -> Token {
        let token = Token::generate();
        self.token = Some(token.clone());
        token
    }

    pub(crate) fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    pub(crate) fn worker_mut(&mut self) -> Option<&mut WorkerHandle> {
        self.worker.as_mut()
    }

    pub(crate) fn set_worker(&mut self, worker: WorkerHandle) {
        if let Some(old) = self.worker.replace(worker) {
            debug!(resource = %self.config.name, pid = %old.pid(), "Dropping superseded worker handle");
            old.close();
        }
    }

    pub(crate) fn take_worker(&mut self) -> Option<WorkerHandle> {
        self.worker.take()
    }

    pub(crate) fn remote_in(&self) -> Option<&Conn> {
        self.remote_in.as_ref()
    }

    pub(crate) fn remote_out(&self) -> Option<&Conn> {
        self.remote_out.as_ref()
    }

    pub(crate) fn set_remote_in(&mut self, conn: Conn) {
        if let Some(old) = self.remote_in.replace(conn) {
            old.close();
        }
    }

    pub(crate) fn set_remote_out(&mut self, conn: Conn) {
        if let Some(old) = self.remote_out.replace(conn) {
            old.close();
        }
    }

    /// Close both peer sockets, if open.
    pub(crate) fn close_remote(&mut self) {
        if let Some(conn) = self.remote_in.take() {
            conn.close();
        }
        if let Some(conn) = self.remote_out.take() {
            conn.close();
        }
    }

    pub fn status(&self) -> ResourceStatus {
        ResourceStatus {
            name: self.config.name.clone(),
            role: self.role,
            provider: self.config.provider().to_string(),
            local: self.config.local.clone(),
            remote: self.config.remote.clone(),
            replication: self.config.replication(),
            worker_pid: self.worker_pid().map(Pid::as_raw),
            connected: self.remote_in.is_some() || self.remote_out.is_some(),
            local_count: self.local_count,
            remote_count: self.remote_count,
        }
    }
}

/// Snapshot of a resource reported over the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub name: String,
    pub role: Role,
    pub provider: String,
    pub local: String,
    pub remote: String,
    pub replication: ReplicationMode,
    pub worker_pid: Option<i32>,
    pub connected: bool,
    pub local_count: u64,
    pub remote_count: u64,
}
