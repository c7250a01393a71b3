#![deny(unsafe_code)]

//! hast core runtime.
//!
//! Provides the pluggable connection transports, the wire messages exchanged
//! between peers, the control daemon that owns every configured resource, and
//! the worker processes it supervises. The `hastd` binary is a thin shell
//! around [`Daemon`] and [`worker::session::run`].

/// Client for the daemon's local control socket.
pub mod control;
/// Control daemon: event loop, handshake, supervision, and reload.
pub mod daemon;
/// Peer handshake: the connecting (primary) side and its error type.
pub mod handshake;
/// Detached execution of the configured event hook.
pub mod hooks;
/// Length-prefixed JSON framing and the messages carried over it.
pub mod message;
/// Per-resource runtime state.
pub mod resource;
/// Session token issued on first contact.
pub mod token;
/// Address-driven connection transports (TCP, Unix domain).
pub mod transport;
/// Worker processes: launching, setup hand-off, exit policy, and the worker body.
pub mod worker;

pub use control::ControlClient;
pub use daemon::{Change, Daemon, DaemonError, PeerOutcome, ReloadSummary};
pub use resource::{Resource, ResourceStatus, Role};
pub use token::Token;
pub use transport::{Conn, Registry, Side, Timeout, Transport, TransportError};
pub use worker::{ProcessLauncher, WorkerExit, WorkerLauncher};
