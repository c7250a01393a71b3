//! Worker processes.
//!
//! One worker runs per actively served resource. The daemon spawns it
//! through a [`WorkerLauncher`], then hands it its parameters and channels
//! over the control channel:
//!
//! 1. a [`WorkerSetup`] message,
//! 2. the worker end of the event channel,
//! 3. PRIMARY: the worker end of the connection-request channel;
//!    SECONDARY: duplicates of the inbound and outbound peer sockets.
//!
//! The exit policy lives in [`classify_exit`], a pure function, so the
//! supervision rules can be tested without real processes.

pub mod session;

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use hast_config::ResourceConfig;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::message::{MessageError, WorkerSetup, recv_message, send_message};
use crate::resource::{Resource, Role};
use crate::transport::{Conn, Registry, Side, Transport, TransportError};

/// Exit status a worker uses for "try again".
pub const EX_TEMPFAIL: i32 = 75;

/// Exit status for local storage that cannot be opened.
pub const EX_NOINPUT: i32 = 66;

/// Delay before a PRIMARY worker is restarted.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// How long a graceful stop waits before escalating to SIGKILL.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Exited(i32),
    Signaled(i32),
    /// The process was gone before its status could be collected.
    Unknown,
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig}"),
            Self::Unknown => f.write_str("exited with unknown status"),
        }
    }
}

/// What the daemon does after a worker exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Release the worker's channels and keep the role.
    Release,
    /// Wait [`RESTART_DELAY`] and spawn a new worker.
    Restart,
    /// Release everything and fall back to INIT.
    Demote,
}

/// Exit policy: PRIMARY workers are restarted after a signal or a
/// temporary failure, any SECONDARY exit demotes, and INIT never has
/// anything to restart.
pub fn classify_exit(role: Role, exit: WorkerExit) -> ExitAction {
    match role {
        Role::Init => ExitAction::Release,
        Role::Secondary => ExitAction::Demote,
        Role::Primary => match exit {
            WorkerExit::Exited(0) => ExitAction::Release,
            WorkerExit::Signaled(_) | WorkerExit::Exited(EX_TEMPFAIL) => ExitAction::Restart,
            WorkerExit::Exited(_) | WorkerExit::Unknown => ExitAction::Demote,
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("unable to start worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("unable to signal worker {pid}: {source}")]
    Signal {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("unable to collect worker {pid}: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("no {0} peer connection to hand over")]
    MissingPeer(&'static str),
}

/// A freshly spawned worker, before its channels are handed over.
#[derive(Debug)]
pub struct Spawned {
    pub pid: Pid,
    /// Daemon end of the control channel.
    pub ctrl: Conn,
}

/// Starts and signals worker processes.
///
/// The daemon only ever reaps the pids it was handed by [`spawn`](Self::spawn).
pub trait WorkerLauncher {
    /// Start a worker for `config` in `role`.
    fn spawn(
        &mut self,
        registry: &Registry,
        config: &ResourceConfig,
        role: Role,
    ) -> Result<Spawned, WorkerError>;

    /// Ask the worker to exit.
    fn terminate(&mut self, pid: Pid) -> Result<(), WorkerError>;

    /// Force the worker to exit.
    fn kill(&mut self, pid: Pid) -> Result<(), WorkerError>;

    /// Collect the worker's exit status without blocking.
    fn try_wait(&mut self, pid: Pid) -> Result<Option<WorkerExit>, WorkerError>;
}

/// Launches workers by re-executing a program (normally the daemon binary)
/// as `PROGRAM worker --ctrl-fd N`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    log_filter: Option<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            log_filter: None,
        }
    }

    /// Launcher re-executing the running binary.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Pass `filter` to workers as their `RUST_LOG`.
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    fn signal(pid: Pid, sig: Signal) -> Result<(), WorkerError> {
        match signal::kill(pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(WorkerError::Signal { pid, source }),
        }
    }
}

fn clear_cloexec(fd: &impl AsRawFd) -> Result<(), WorkerError> {
    let raw = fd.as_raw_fd();
    let mut flags = FdFlag::from_bits_truncate(
        fcntl(raw, FcntlArg::F_GETFD).map_err(|e| WorkerError::Spawn(e.into()))?,
    );
    flags.remove(FdFlag::FD_CLOEXEC);
    fcntl(raw, FcntlArg::F_SETFD(flags)).map_err(|e| WorkerError::Spawn(e.into()))?;
    Ok(())
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(
        &mut self,
        registry: &Registry,
        config: &ResourceConfig,
        role: Role,
    ) -> Result<Spawned, WorkerError> {
        let (ours, theirs) = UnixStream::pair().map_err(WorkerError::Spawn)?;
        clear_cloexec(&theirs)?;

        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .arg("--ctrl-fd")
            .arg(theirs.as_raw_fd().to_string())
            .stdin(Stdio::null());
        if let Some(filter) = &self.log_filter {
            command.env("RUST_LOG", filter);
        }
        // The std handle is dropped without waiting; the daemon reaps by pid.
        let child = command.spawn().map_err(WorkerError::Spawn)?;
        drop(theirs);

        let pid = Pid::from_raw(child.id() as i32);
        let ctrl = registry.wrap(Transport::UnixDomain, ours.into(), Side::Client)?;
        info!(%pid, resource = %config.name, %role, "Worker process started");
        Ok(Spawned { pid, ctrl })
    }

    fn terminate(&mut self, pid: Pid) -> Result<(), WorkerError> {
        Self::signal(pid, Signal::SIGTERM)
    }

    fn kill(&mut self, pid: Pid) -> Result<(), WorkerError> {
        Self::signal(pid, Signal::SIGKILL)
    }

    fn try_wait(&mut self, pid: Pid) -> Result<Option<WorkerExit>, WorkerError> {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Ok(Some(WorkerExit::Exited(code))),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(WorkerExit::Signaled(sig as i32))),
            Ok(_) => Ok(None),
            Err(Errno::ECHILD) => Ok(Some(WorkerExit::Unknown)),
            Err(source) => Err(WorkerError::Wait { pid, source }),
        }
    }
}

/// The daemon's side of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Pid,
    ctrl: Conn,
    event: Option<Conn>,
    conn: Option<Conn>,
    /// Last sequence number used on the control channel.
    ctrl_seq: u64,
}

impl WorkerHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn ctrl_mut(&mut self) -> &mut Conn {
        &mut self.ctrl
    }

    pub(crate) fn next_ctrl_seq(&mut self) -> u64 {
        self.ctrl_seq += 1;
        self.ctrl_seq
    }

    pub(crate) fn event(&self) -> Option<&Conn> {
        self.event.as_ref()
    }

    pub(crate) fn event_mut(&mut self) -> Option<&mut Conn> {
        self.event.as_mut()
    }

    pub(crate) fn conn(&self) -> Option<&Conn> {
        self.conn.as_ref()
    }

    pub(crate) fn conn_mut(&mut self) -> Option<&mut Conn> {
        self.conn.as_mut()
    }

    /// Stop polling the event channel (the worker closed it).
    pub(crate) fn close_event(&mut self) {
        if let Some(conn) = self.event.take() {
            conn.close();
        }
    }

    /// Stop polling the connection-request channel.
    pub(crate) fn close_conn(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }

    /// Close every channel to the worker.
    pub(crate) fn close(self) {
        debug!(pid = %self.pid, "Closing worker channels");
    }
}

fn channel_pair(registry: &Registry) -> Result<(Conn, Conn), WorkerError> {
    let (ours, theirs) = UnixStream::pair().map_err(WorkerError::Spawn)?;
    Ok((
        registry.wrap(Transport::UnixDomain, ours.into(), Side::Client)?,
        registry.wrap(Transport::UnixDomain, theirs.into(), Side::ServerWork)?,
    ))
}

/// Send setup and channels to a just-spawned worker. Returns the daemon ends
/// of the event and connection-request channels.
async fn hand_off(
    registry: &Registry,
    ctrl: &mut Conn,
    res: &Resource,
    role: Role,
) -> Result<(Conn, Option<Conn>), WorkerError> {
    send_message(ctrl, &WorkerSetup::new(res.config(), role)).await?;

    let (event, theirs) = channel_pair(registry)?;
    ctrl.send_conn(theirs).await?;

    let conn = match role {
        Role::Primary => {
            let (conn, theirs) = channel_pair(registry)?;
            ctrl.send_conn(theirs).await?;
            Some(conn)
        }
        Role::Secondary => {
            let inbound = res.remote_in().ok_or(WorkerError::MissingPeer("inbound"))?;
            ctrl.send_duplicate(inbound).await?;
            let outbound = res
                .remote_out()
                .ok_or(WorkerError::MissingPeer("outbound"))?;
            ctrl.send_duplicate(outbound).await?;
            None
        }
        Role::Init => None,
    };
    Ok((event, conn))
}

/// Spawn a worker for `res` in its current role and attach it.
pub(crate) async fn start<L: WorkerLauncher>(
    launcher: &mut L,
    registry: &Registry,
    res: &mut Resource,
) -> Result<(), WorkerError> {
    let role = res.role();
    let io_timeout = Some(Duration::from_secs(res.config().timeout_secs()));
    let Spawned { pid, mut ctrl } = launcher.spawn(registry, res.config(), role)?;
    ctrl.set_timeout(io_timeout);

    match hand_off(registry, &mut ctrl, res, role).await {
        Ok((mut event, mut conn)) => {
            event.set_timeout(io_timeout);
            if let Some(conn) = conn.as_mut() {
                conn.set_timeout(io_timeout);
            }
            res.set_worker(WorkerHandle {
                pid,
                ctrl,
                event: Some(event),
                conn,
                ctrl_seq: 0,
            });
            Ok(())
        }
        Err(err) => {
            error!(%pid, error = %err, "Unable to hand channels to worker, killing it");
            let handle = WorkerHandle {
                pid,
                ctrl,
                event: None,
                conn: None,
                ctrl_seq: 0,
            };
            stop(launcher, handle, false).await;
            Err(err)
        }
    }
}

/// Stop a worker and reap it.
///
/// A graceful stop sends SIGTERM and waits up to [`STOP_TIMEOUT`] before
/// falling back to SIGKILL.
pub(crate) async fn stop<L: WorkerLauncher>(
    launcher: &mut L,
    handle: WorkerHandle,
    graceful: bool,
) -> Option<WorkerExit> {
    let pid = handle.pid();
    handle.close();

    if graceful {
        if let Err(err) = launcher.terminate(pid) {
            warn!(%pid, error = %err, "Unable to signal worker");
        }
        let deadline = Instant::now() + STOP_TIMEOUT;
        loop {
            match launcher.try_wait(pid) {
                Ok(Some(exit)) => {
                    debug!(%pid, %exit, "Worker stopped");
                    return Some(exit);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%pid, error = %err, "Unable to collect worker");
                    return None;
                }
            }
            if Instant::now() >= deadline {
                warn!(%pid, "Worker did not exit in time, killing it");
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    if let Err(err) = launcher.kill(pid) {
        warn!(%pid, error = %err, "Unable to kill worker");
    }
    loop {
        match launcher.try_wait(pid) {
            Ok(Some(exit)) => {
                debug!(%pid, %exit, "Worker killed");
                return Some(exit);
            }
            Ok(None) => tokio::time::sleep(STOP_POLL_INTERVAL).await,
            Err(err) => {
                warn!(%pid, error = %err, "Unable to collect worker");
                return None;
            }
        }
    }
}

/// Everything a worker receives from the daemon at startup.
#[derive(Debug)]
pub struct WorkerChannels {
    pub setup: WorkerSetup,
    /// Worker end of the event channel.
    pub event: Conn,
    /// Worker end of the connection-request channel (PRIMARY).
    pub conn: Option<Conn>,
    /// Inbound peer socket (SECONDARY).
    pub remote_in: Option<Conn>,
    /// Outbound peer socket (SECONDARY).
    pub remote_out: Option<Conn>,
}

/// Worker side of the hand-off: read the setup and the channels that follow.
pub async fn receive_setup(ctrl: &mut Conn) -> Result<WorkerChannels, WorkerError> {
    let setup: WorkerSetup = recv_message(ctrl).await?;
    let event = ctrl.recv_conn(Side::Client).await?;
    let mut channels = WorkerChannels {
        setup,
        event,
        conn: None,
        remote_in: None,
        remote_out: None,
    };
    match channels.setup.role {
        Role::Primary => channels.conn = Some(ctrl.recv_conn(Side::Client).await?),
        Role::Secondary => {
            channels.remote_in = Some(ctrl.recv_conn(Side::ServerWork).await?);
            channels.remote_out = Some(ctrl.recv_conn(Side::ServerWork).await?);
        }
        Role::Init => {}
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_exit_policy() {
        assert_eq!(
            classify_exit(Role::Primary, WorkerExit::Exited(0)),
            ExitAction::Release
        );
        assert_eq!(
            classify_exit(Role::Primary, WorkerExit::Signaled(9)),
            ExitAction::Restart
        );
        assert_eq!(
            classify_exit(Role::Primary, WorkerExit::Exited(EX_TEMPFAIL)),
            ExitAction::Restart
        );
        assert_eq!(
            classify_exit(Role::Primary, WorkerExit::Exited(EX_NOINPUT)),
            ExitAction::Demote
        );
        assert_eq!(
            classify_exit(Role::Primary, WorkerExit::Unknown),
            ExitAction::Demote
        );
    }

    #[test]
    fn test_secondary_always_demotes() {
        for exit in [
            WorkerExit::Exited(0),
            WorkerExit::Exited(EX_TEMPFAIL),
            WorkerExit::Signaled(15),
        ] {
            assert_eq!(classify_exit(Role::Secondary, exit), ExitAction::Demote);
        }
    }

    #[test]
    fn test_init_releases() {
        assert_eq!(
            classify_exit(Role::Init, WorkerExit::Signaled(9)),
            ExitAction::Release
        );
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(WorkerExit::Exited(75).to_string(), "exited with status 75");
        assert_eq!(WorkerExit::Signaled(9).to_string(), "killed by signal 9");
    }

    #[tokio::test]
    async fn test_process_launcher_reaps_failed_child() {
        let registry = Registry::new();
        let config = ResourceConfig::new("r0", "/dev/null", "tcp://127.0.0.1");
        // /bin/sh treats "worker" as a script path that does not exist.
        let mut launcher = ProcessLauncher::new("/bin/sh");
        let spawned = launcher.spawn(&registry, &config, Role::Primary).unwrap();

        let exit = loop {
            if let Some(exit) = launcher.try_wait(spawned.pid).unwrap() {
                break exit;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert!(matches!(exit, WorkerExit::Exited(code) if code != 0));
        // Already reaped: the pid is no longer our child.
        assert_eq!(launcher.try_wait(spawned.pid).unwrap(), Some(WorkerExit::Unknown));
    }
}
