//! Worker process body.
//!
//! A worker is started by the daemon as `hastd worker --ctrl-fd N`. It reads
//! its setup from the control channel, opens local storage, and then keeps
//! the peer session for one resource alive:
//!
//! - PRIMARY asks the daemon for two outbound connections, runs the
//!   connecting side of the handshake on them, and exits with
//!   [`EX_TEMPFAIL`] when the session is lost so the daemon restarts it.
//! - SECONDARY is handed both peer sockets, reports `disconnect` when the
//!   peer goes away and exits with [`EX_TEMPFAIL`].
//!
//! SIGTERM ends either role with status 0.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use hast_config::ReplicationMode;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use tokio::fs::{File, OpenOptions};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{EX_NOINPUT, EX_TEMPFAIL, WorkerChannels, receive_setup};
use crate::handshake::{HandshakeError, client_leg};
use crate::message::{
    ConnReply, ConnRequest, CtrlReply, CtrlRequest, MessageError, WorkerEvent, WorkerSetup,
    recv_message, send_message,
};
use crate::resource::Role;
use crate::transport::{Conn, Registry, Side, Transport, TransportError};

/// Exit status for a worker that lost its daemon or was set up wrongly.
const EX_FAILURE: i32 = 1;

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("daemon could not connect to peer: {0}")]
    Connect(#[source] io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Entry point of the worker process. Returns the process exit status.
pub async fn run(ctrl_fd: RawFd) -> i32 {
    let fd = match adopt_ctrl_fd(ctrl_fd) {
        Ok(fd) => fd,
        Err(err) => {
            error!(fd = ctrl_fd, error = %err, "Control descriptor is not usable");
            return EX_FAILURE;
        }
    };
    let ctrl = match Registry::new().wrap(Transport::UnixDomain, fd, Side::ServerWork) {
        Ok(conn) => conn,
        Err(err) => {
            error!(error = %err, "Unable to set up control channel");
            return EX_FAILURE;
        }
    };
    serve(ctrl).await
}

fn adopt_ctrl_fd(fd: RawFd) -> Result<OwnedFd, Errno> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    // SAFETY: the descriptor was inherited from the daemon, F_GETFD shows it
    // is open, and nothing else in this process owns it.
    #[allow(unsafe_code)]
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(owned)
}

/// Run a worker over an already connected control channel.
pub async fn serve(mut ctrl: Conn) -> i32 {
    let channels = match receive_setup(&mut ctrl).await {
        Ok(channels) => channels,
        Err(err) => {
            error!(error = %err, "Unable to receive worker setup");
            return EX_FAILURE;
        }
    };
    let span = info_span!(
        "worker",
        resource = %channels.setup.name,
        role = %channels.setup.role
    );
    serve_resource(ctrl, channels).instrument(span).await
}

async fn serve_resource(ctrl: Conn, channels: WorkerChannels) -> i32 {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(error = %err, "Unable to install signal handler");
            return EX_FAILURE;
        }
    };

    let storage = match open_storage(&channels.setup.local).await {
        Ok(storage) => storage,
        Err(err) => {
            error!(local = %channels.setup.local, error = %err, "Unable to open local storage");
            return EX_NOINPUT;
        }
    };

    let status = match channels.setup.role {
        Role::Primary => Primary::new(ctrl, channels).run(&mut sigterm).await,
        Role::Secondary => Secondary::new(ctrl, channels).run(&mut sigterm).await,
        Role::Init => {
            error!("Worker started without a role");
            EX_FAILURE
        }
    };
    drop(storage);
    status
}

async fn open_storage(path: &str) -> io::Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(path).await?;
    let size = file.metadata().await?.len();
    debug!(local = %path, size, "Local storage opened");
    Ok(file)
}

async fn emit(event_chan: &mut Conn, event: WorkerEvent) {
    if let Err(err) = send_message(event_chan, &event).await {
        warn!(%event, error = %err, "Unable to report event to daemon");
    }
}

/// Apply a reload request to `setup`. Returns the reply code and whether the
/// peer address changed.
fn apply_reload(setup: &mut WorkerSetup, request: CtrlRequest) -> (i16, bool) {
    let CtrlRequest::Reload {
        seq: _,
        remoteaddr,
        replication,
        timeout,
        exec,
    } = request;

    let Some(replication) = ReplicationMode::from_i32(replication) else {
        warn!(replication, "Reload with unknown replication mode refused");
        return (Errno::EINVAL as i16, false);
    };
    let timeout = match u64::try_from(timeout) {
        Ok(timeout) if timeout > 0 => timeout,
        _ => {
            warn!(timeout, "Reload with invalid timeout refused");
            return (Errno::EINVAL as i16, false);
        }
    };

    let remote_changed = setup.remote != remoteaddr;
    setup.remote = remoteaddr;
    setup.replication = replication;
    setup.timeout = timeout;
    setup.exec = (!exec.is_empty()).then_some(exec);
    info!(
        remote = %setup.remote,
        %replication,
        timeout,
        remote_changed,
        "Configuration reloaded"
    );
    (0, remote_changed)
}

/// Read the next control request and answer it. Returns whether the peer
/// address changed.
async fn serve_ctrl(ctrl: &mut Conn, setup: &mut WorkerSetup) -> Result<bool, MessageError> {
    let request: CtrlRequest = recv_message(ctrl).await?;
    let seq = request.seq();
    let (error, remote_changed) = apply_reload(setup, request);
    send_message(ctrl, &CtrlReply { seq, error }).await?;
    Ok(remote_changed)
}

/// Drain whatever made a peer socket readable. The block replication
/// stream does not run over this session, so any outcome ends it.
async fn peer_lost(conn: &mut Conn) {
    let mut byte = [0u8; 1];
    match conn.recv(&mut byte).await {
        Err(TransportError::NotConnected) => info!("Peer closed the connection"),
        Err(err) => warn!(error = %err, "Peer connection failed"),
        Ok(()) => warn!("Unexpected data from peer"),
    }
}

struct Primary {
    setup: WorkerSetup,
    ctrl: Conn,
    event: Conn,
    conn: Option<Conn>,
    /// Set when a reload moved the peer while a session was being set up.
    remote_changed: bool,
}

impl Primary {
    fn new(ctrl: Conn, channels: WorkerChannels) -> Self {
        Self {
            setup: channels.setup,
            ctrl,
            event: channels.event,
            conn: channels.conn,
            remote_changed: false,
        }
    }

    fn io_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.setup.timeout))
    }

    /// Ask the daemon for a connection to the peer. Control requests that
    /// arrive before the reply are answered while waiting for it.
    async fn request_connection(&mut self) -> Result<Conn, SessionError> {
        let Self {
            setup,
            ctrl,
            conn: requests,
            remote_changed,
            ..
        } = self;
        let chan = requests.as_mut().ok_or(TransportError::NotConnected)?;
        send_message(chan, &ConnRequest {}).await?;
        loop {
            tokio::select! {
                biased;

                _ = ctrl.readable() => {
                    ctrl.set_timeout(Some(Duration::from_secs(setup.timeout)));
                    if serve_ctrl(ctrl, setup).await? {
                        *remote_changed = true;
                    }
                }
                _ = chan.readable() => break,
            }
        }

        let reply: ConnReply = recv_message(chan).await?;
        if reply.error != 0 {
            return Err(SessionError::Connect(io::Error::from_raw_os_error(
                reply.error,
            )));
        }
        let mut conn = chan.recv_conn(Side::Client).await?;
        conn.set_timeout(Some(Duration::from_secs(setup.timeout)));
        Ok(conn)
    }

    /// Open both legs of a session. Returns (outbound, inbound).
    async fn establish(&mut self) -> Result<(Conn, Conn), SessionError> {
        let mut outbound = self.request_connection().await?;
        let token = client_leg(&mut outbound, &self.setup.name, None).await?;
        debug!("Outbound connection established");

        let mut inbound = self.request_connection().await?;
        client_leg(&mut inbound, &self.setup.name, Some(&token)).await?;
        info!(remote = %self.setup.remote, "Connected to peer");
        Ok((outbound, inbound))
    }

    /// [`Self::establish`], starting over if the peer address changed
    /// before both legs were up.
    async fn connect(&mut self) -> Result<(Conn, Conn), SessionError> {
        loop {
            self.remote_changed = false;
            let (outbound, inbound) = self.establish().await?;
            if !self.remote_changed {
                return Ok((outbound, inbound));
            }
            info!(remote = %self.setup.remote, "Peer address changed while connecting, reconnecting");
            outbound.close();
            inbound.close();
        }
    }

    async fn run(mut self, sigterm: &mut Signal) -> i32 {
        let (mut outbound, mut inbound) = match self.connect().await {
            Ok(legs) => legs,
            Err(err) => {
                error!(remote = %self.setup.remote, error = %err, "Unable to establish session");
                return EX_TEMPFAIL;
            }
        };
        emit(&mut self.event, WorkerEvent::Connect).await;

        loop {
            tokio::select! {
                biased;

                _ = sigterm.recv() => {
                    info!("Termination requested");
                    return 0;
                }
                _ = self.ctrl.readable() => {
                    self.ctrl.set_timeout(self.io_timeout());
                    match serve_ctrl(&mut self.ctrl, &mut self.setup).await {
                        Ok(false) => {
                            let io_timeout = self.io_timeout();
                            outbound.set_timeout(io_timeout);
                            inbound.set_timeout(io_timeout);
                        }
                        Ok(true) => {
                            info!(remote = %self.setup.remote, "Peer address changed, reconnecting");
                            outbound.close();
                            inbound.close();
                            emit(&mut self.event, WorkerEvent::Disconnect).await;
                            match self.connect().await {
                                Ok(legs) => (outbound, inbound) = legs,
                                Err(err) => {
                                    error!(remote = %self.setup.remote, error = %err, "Unable to establish session");
                                    return EX_TEMPFAIL;
                                }
                            }
                            emit(&mut self.event, WorkerEvent::Connect).await;
                        }
                        Err(err) => {
                            if err.is_disconnect() {
                                info!("Daemon closed the control channel");
                            } else {
                                error!(error = %err, "Control channel failed");
                            }
                            return EX_FAILURE;
                        }
                    }
                }
                _ = outbound.readable() => {
                    peer_lost(&mut outbound).await;
                    emit(&mut self.event, WorkerEvent::Disconnect).await;
                    return EX_TEMPFAIL;
                }
                _ = inbound.readable() => {
                    peer_lost(&mut inbound).await;
                    emit(&mut self.event, WorkerEvent::Disconnect).await;
                    return EX_TEMPFAIL;
                }
            }
        }
    }
}

struct Secondary {
    setup: WorkerSetup,
    ctrl: Conn,
    event: Conn,
    remote_in: Option<Conn>,
    remote_out: Option<Conn>,
}

impl Secondary {
    fn new(ctrl: Conn, channels: WorkerChannels) -> Self {
        Self {
            setup: channels.setup,
            ctrl,
            event: channels.event,
            remote_in: channels.remote_in,
            remote_out: channels.remote_out,
        }
    }

    async fn run(mut self, sigterm: &mut Signal) -> i32 {
        let (Some(mut remote_in), Some(mut remote_out)) =
            (self.remote_in.take(), self.remote_out.take())
        else {
            error!("Secondary worker started without peer connections");
            return EX_FAILURE;
        };
        info!("Serving peer session");
        emit(&mut self.event, WorkerEvent::Connect).await;

        loop {
            tokio::select! {
                biased;

                _ = sigterm.recv() => {
                    info!("Termination requested");
                    return 0;
                }
                _ = self.ctrl.readable() => {
                    self.ctrl.set_timeout(Some(Duration::from_secs(self.setup.timeout)));
                    if let Err(err) = serve_ctrl(&mut self.ctrl, &mut self.setup).await {
                        if err.is_disconnect() {
                            info!("Daemon closed the control channel");
                        } else {
                            error!(error = %err, "Control channel failed");
                        }
                        return EX_FAILURE;
                    }
                }
                _ = remote_in.readable() => {
                    peer_lost(&mut remote_in).await;
                    emit(&mut self.event, WorkerEvent::Disconnect).await;
                    return EX_TEMPFAIL;
                }
                _ = remote_out.readable() => {
                    peer_lost(&mut remote_out).await;
                    emit(&mut self.event, WorkerEvent::Disconnect).await;
                    return EX_TEMPFAIL;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hast_config::ResourceConfig;
    use pretty_assertions::assert_eq;

    fn setup() -> WorkerSetup {
        WorkerSetup::new(
            &ResourceConfig::new("r0", "/dev/da0", "tcp://10.0.0.2"),
            Role::Primary,
        )
    }

    fn reload(remote: &str, replication: i32, timeout: i32) -> CtrlRequest {
        CtrlRequest::Reload {
            seq: 1,
            remoteaddr: remote.into(),
            replication,
            timeout,
            exec: String::new(),
        }
    }

    #[test]
    fn test_reload_updates_setup() {
        let mut setup = setup();
        let (error, changed) = apply_reload(&mut setup, reload("tcp://10.0.0.3", 2, 5));
        assert_eq!(error, 0);
        assert!(changed);
        assert_eq!(setup.remote, "tcp://10.0.0.3");
        assert_eq!(setup.replication, ReplicationMode::Async);
        assert_eq!(setup.timeout, 5);
        assert_eq!(setup.exec, None);
    }

    #[test]
    fn test_reload_same_remote_keeps_session() {
        let mut setup = setup();
        let (error, changed) = apply_reload(&mut setup, reload("tcp://10.0.0.2", 0, 20));
        assert_eq!(error, 0);
        assert!(!changed);
        assert_eq!(setup.replication, ReplicationMode::Fullsync);
    }

    #[test]
    fn test_reload_rejects_bad_values() {
        let mut setup = setup();
        let before = setup.clone();
        assert_eq!(
            apply_reload(&mut setup, reload("tcp://10.0.0.3", 9, 20)),
            (Errno::EINVAL as i16, false)
        );
        assert_eq!(
            apply_reload(&mut setup, reload("tcp://10.0.0.3", 1, 0)),
            (Errno::EINVAL as i16, false)
        );
        assert_eq!(setup, before);
    }

    #[tokio::test]
    async fn test_reply_echoes_request_seq() {
        let registry = Registry::new();
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut daemon_end = registry
            .wrap(Transport::UnixDomain, ours.into(), Side::Client)
            .unwrap();
        let mut worker_end = registry
            .wrap(Transport::UnixDomain, theirs.into(), Side::ServerWork)
            .unwrap();
        let mut setup = setup();

        send_message(&mut daemon_end, &reload("tcp://10.0.0.3", 9, 5))
            .await
            .unwrap();
        assert!(!serve_ctrl(&mut worker_end, &mut setup).await.unwrap());
        let reply: CtrlReply = recv_message(&mut daemon_end).await.unwrap();
        assert_eq!(
            reply,
            CtrlReply {
                seq: 1,
                error: Errno::EINVAL as i16
            }
        );
    }

    #[tokio::test]
    async fn test_missing_storage_exits_noinput() {
        let registry = Registry::new();
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut daemon_end = registry
            .wrap(Transport::UnixDomain, ours.into(), Side::Client)
            .unwrap();
        let worker_end = registry
            .wrap(Transport::UnixDomain, theirs.into(), Side::ServerWork)
            .unwrap();

        let mut config = ResourceConfig::new("r0", "/nonexistent/hast/r0", "tcp://10.0.0.2");
        config.timeout = Some(5);
        let (event, _event_peer) = {
            let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
            (
                registry
                    .wrap(Transport::UnixDomain, a.into(), Side::ServerWork)
                    .unwrap(),
                registry
                    .wrap(Transport::UnixDomain, b.into(), Side::Client)
                    .unwrap(),
            )
        };
        let (conn, _conn_peer) = {
            let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
            (
                registry
                    .wrap(Transport::UnixDomain, a.into(), Side::ServerWork)
                    .unwrap(),
                registry
                    .wrap(Transport::UnixDomain, b.into(), Side::Client)
                    .unwrap(),
            )
        };

        let daemon = async {
            send_message(&mut daemon_end, &WorkerSetup::new(&config, Role::Primary))
                .await
                .unwrap();
            daemon_end.send_conn(event).await.unwrap();
            daemon_end.send_conn(conn).await.unwrap();
        };
        let (status, ()) = tokio::join!(serve(worker_end), daemon);
        assert_eq!(status, EX_NOINPUT);
    }
}
