//! Control daemon: startup, the event loop, role changes and shutdown.
//!
//! The daemon is the only code that touches resource state. A single task
//! multiplexes, in priority order:
//!
//! 1. signals (reload, shutdown, child exit),
//! 2. the peer listener (handshakes),
//! 3. the control socket (administrative commands),
//! 4. every worker's event and connection-request channels,
//! 5. a periodic wake-up that reaps workers whose SIGCHLD was coalesced.
//!
//! Each branch runs to completion before the next pass, so a signal that
//! arrives together with socket readiness is always handled first.

mod control;
mod handshake;
mod reload;
mod supervise;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures_util::future::select_all;
use hast_config::{ConfigError, HastConfig};
use nix::errno::Errno;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use crate::hooks;
use crate::resource::{Resource, ResourceStatus, Role};
use crate::transport::{Conn, Registry, TransportError};
use crate::worker::{self, ProcessLauncher, WorkerError, WorkerLauncher};

pub use handshake::PeerOutcome;
pub use reload::{Change, ReloadSummary, classify_change};

/// Upper bound on how long the event loop sleeps without checking workers.
pub const WAKE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("unable to listen on {what} address {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no such resource: {0}")]
    NoSuchResource(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("no configuration file to reload from")]
    NoConfigPath,

    #[error("unable to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

impl DaemonError {
    /// errno equivalent reported over the control socket.
    pub fn errno(&self) -> i32 {
        let errno = match self {
            Self::NoSuchResource(_) => Errno::ENOENT,
            Self::Bind { source, .. } => return source.errno(),
            Self::Config(_) | Self::NoConfigPath => Errno::EINVAL,
            Self::Worker(_) | Self::Signal(_) => Errno::EIO,
        };
        errno as i32
    }
}

/// Readiness on one of a worker's channels.
#[derive(Debug, Clone, Copy)]
enum WorkerReady {
    Event(usize),
    ConnRequest(usize),
}

/// Resolves when any worker channel has data or has been closed.
async fn next_worker_ready(resources: &[Resource]) -> WorkerReady {
    let mut waits: Vec<Pin<Box<dyn Future<Output = WorkerReady> + '_>>> = Vec::new();
    for (idx, res) in resources.iter().enumerate() {
        let Some(worker) = res.worker() else {
            continue;
        };
        if let Some(event) = worker.event() {
            waits.push(Box::pin(async move {
                let _ = event.readable().await;
                WorkerReady::Event(idx)
            }));
        }
        if let Some(conn) = worker.conn() {
            waits.push(Box::pin(async move {
                let _ = conn.readable().await;
                WorkerReady::ConnRequest(idx)
            }));
        }
    }
    if waits.is_empty() {
        return std::future::pending().await;
    }
    select_all(waits).await.0
}

async fn bind(registry: &Registry, what: &'static str, addr: &str) -> Result<Conn, DaemonError> {
    registry
        .server(addr)
        .await
        .map_err(|source| DaemonError::Bind {
            what,
            addr: addr.to_string(),
            source,
        })
}

/// The hast control daemon.
pub struct Daemon<L: WorkerLauncher = ProcessLauncher> {
    config: HastConfig,
    config_path: Option<PathBuf>,
    registry: Registry,
    control: Conn,
    listen: Conn,
    resources: Vec<Resource>,
    launcher: L,
}

impl<L: WorkerLauncher> Daemon<L> {
    /// Bind the control and listen addresses and load every resource in
    /// INIT. Any failure here is fatal.
    ///
    /// `config` is validated and its resource defaults resolved the same
    /// way a reload does it.
    pub async fn start(
        mut config: HastConfig,
        config_path: Option<PathBuf>,
        launcher: L,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        config.resolve();

        let registry = Registry::new();
        let control = bind(&registry, "control", &config.daemon.control).await?;
        let listen = bind(&registry, "listen", &config.daemon.listen).await?;
        let resources = config
            .resources
            .iter()
            .cloned()
            .map(Resource::new)
            .collect();

        info!(
            control = %control.local_address(),
            listen = %listen.local_address(),
            resources = config.resources.len(),
            "hast daemon started"
        );

        Ok(Self {
            config,
            config_path,
            registry,
            control,
            listen,
            resources,
            launcher,
        })
    }

    /// Get a reference to the daemon's configuration.
    pub fn config(&self) -> &HastConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn launcher_mut(&mut self) -> &mut L {
        &mut self.launcher
    }

    /// Bound control address, e.g. `uds:///var/run/hastctl`.
    pub fn control_address(&self) -> String {
        self.control.local_address()
    }

    /// Bound peer-listen address, e.g. `tcp://0.0.0.0:8457`.
    pub fn listen_address(&self) -> String {
        self.listen.local_address()
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name() == name)
    }

    fn index(&self, name: &str) -> Result<usize, DaemonError> {
        self.resources
            .iter()
            .position(|r| r.name() == name)
            .ok_or_else(|| DaemonError::NoSuchResource(name.to_string()))
    }

    /// Status of `names`, or of every resource when empty.
    pub fn status(&self, names: &[String]) -> Result<Vec<ResourceStatus>, DaemonError> {
        if names.is_empty() {
            return Ok(self.resources.iter().map(Resource::status).collect());
        }
        names
            .iter()
            .map(|name| Ok(self.resources[self.index(name)?].status()))
            .collect()
    }

    /// Change the role of resource `name`.
    pub async fn set_role(&mut self, name: &str, role: Role) -> Result<(), DaemonError> {
        let idx = self.index(name)?;
        self.change_role(idx, role).await
    }

    /// Move a resource to `role`: stop its worker, drop its peer sockets,
    /// and start a fresh PRIMARY worker when asked for one.
    pub(crate) async fn change_role(&mut self, idx: usize, role: Role) -> Result<(), DaemonError> {
        let res = &mut self.resources[idx];
        let old = res.role();
        if old == role {
            debug!(resource = %res.name(), %role, "Role unchanged");
            return Ok(());
        }

        if let Some(worker) = res.take_worker() {
            info!(resource = %res.name(), pid = %worker.pid(), "Stopping worker process");
            worker::stop(&mut self.launcher, worker, true).await;
        }
        res.close_remote();
        res.set_role(role);
        info!(resource = %res.name(), %old, new = %role, "Role changed");
        run_role_hook(res, old, role);

        if role == Role::Primary
            && let Err(err) = worker::start(&mut self.launcher, &self.registry, res).await
        {
            error!(resource = %res.name(), error = %err, "Unable to start worker, changing role back to init");
            res.set_role(Role::Init);
            return Err(err.into());
        }
        Ok(())
    }

    /// Run the event loop until SIGINT or SIGTERM, then shut down.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        let mut sighup = signal(SignalKind::hangup()).map_err(DaemonError::Signal)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(DaemonError::Signal)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;
        let mut sigchld = signal(SignalKind::child()).map_err(DaemonError::Signal)?;
        let mut wake = tokio::time::interval(WAKE_INTERVAL);
        wake.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = sighup.recv() => {
                    info!("Reload signal received");
                    if let Err(err) = self.reload().await {
                        error!(error = %err, "Configuration not reloaded");
                    }
                }
                _ = sigint.recv() => {
                    info!("Interrupt received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Termination signal received, shutting down");
                    break;
                }
                _ = sigchld.recv() => self.reap_workers().await,
                accepted = self.listen.accept() => match accepted {
                    Ok(conn) => {
                        if let Err(err) = self.handle_peer(conn).await {
                            debug!(error = %err, "Peer connection dropped");
                        }
                    }
                    Err(err) => warn!(error = %err, "Unable to accept peer connection"),
                },
                accepted = self.control.accept() => match accepted {
                    Ok(conn) => self.handle_control(conn).await,
                    Err(err) => warn!(error = %err, "Unable to accept control connection"),
                },
                ready = next_worker_ready(&self.resources) => match ready {
                    WorkerReady::Event(idx) => {
                        self.handle_event(idx).await;
                    }
                    WorkerReady::ConnRequest(idx) => self.handle_conn_request(idx).await,
                },
                _ = wake.tick() => self.reap_workers().await,
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Signal every worker to exit without waiting for any of them.
    pub fn shutdown(&mut self) {
        for res in &self.resources {
            if let Some(pid) = res.worker_pid()
                && let Err(err) = self.launcher.terminate(pid)
            {
                warn!(resource = %res.name(), %pid, error = %err, "Unable to signal worker");
            }
        }
        info!("Exiting");
    }
}

fn run_role_hook(res: &Resource, old: Role, new: Role) {
    if let Some(program) = res.config().exec() {
        hooks::exec(program, &["role", res.name(), old.as_str(), new.as_str()]);
    }
}
