//! Configuration reload.
//!
//! The running and new resource sets are reconciled by name. Resources only
//! in the old set are demoted and dropped, resources only in the new set
//! are added in INIT, and the rest go through [`classify_change`].

use hast_config::{HastConfig, ResourceConfig};
use tracing::{debug, error, info, warn};

use super::{Daemon, DaemonError, bind};
use crate::message::{CtrlReply, CtrlRequest, MessageError, recv_message, send_message};
use crate::resource::{Resource, Role};
use crate::transport::Conn;
use crate::worker::WorkerLauncher;

/// What a configuration change requires of a running resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    None,
    /// Demote to INIT, swap the configuration, then restore the role.
    Restart,
    /// Hand the new peer parameters to the running worker.
    Reload,
}

/// Decide how a resource in `role` moves from `old` to `new`.
///
/// Local storage identity always needs a restart. Peer parameters can be
/// renegotiated in place only by a PRIMARY worker.
pub fn classify_change(role: Role, old: &ResourceConfig, new: &ResourceConfig) -> Change {
    if old.provider() != new.provider() || old.local != new.local {
        return Change::Restart;
    }
    let peer_changed = old.remote != new.remote
        || old.replication() != new.replication()
        || old.timeout_secs() != new.timeout_secs()
        || old.exec() != new.exec();
    match (peer_changed, role) {
        (false, _) => Change::None,
        (true, Role::Primary) => Change::Reload,
        (true, Role::Init | Role::Secondary) => Change::Restart,
    }
}

/// Names of the resources a reload touched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    pub reloaded: Vec<String>,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.restarted.is_empty()
            && self.reloaded.is_empty()
    }
}

/// Send a reload request and return the worker's error code.
///
/// Replies left over from earlier requests that timed out carry an older
/// sequence number and are skipped.
async fn send_reload(ctrl: &mut Conn, request: &CtrlRequest) -> Result<i16, MessageError> {
    send_message(ctrl, request).await?;
    loop {
        let reply: CtrlReply = recv_message(ctrl).await?;
        if reply.seq == request.seq() {
            return Ok(reply.error);
        }
        debug!(seq = reply.seq, expected = request.seq(), "Stale control reply skipped");
    }
}

impl<L: WorkerLauncher> Daemon<L> {
    /// Re-read the configuration file and apply it.
    pub async fn reload(&mut self) -> Result<ReloadSummary, DaemonError> {
        let path = self.config_path.clone().ok_or(DaemonError::NoConfigPath)?;
        info!(path = %path.display(), "Reloading configuration");
        let config = HastConfig::load(&path).await?;
        self.apply_config(config).await
    }

    /// Reconcile the running state with `new`.
    ///
    /// Changed control or listen addresses are bound before anything else;
    /// if either bind fails the reload is abandoned with nothing changed.
    pub async fn apply_config(&mut self, mut new: HastConfig) -> Result<ReloadSummary, DaemonError> {
        new.validate()?;
        new.resolve();

        let control = self
            .rebind("control", &self.config.daemon.control, &new.daemon.control)
            .await?;
        let listen = self
            .rebind("listen", &self.config.daemon.listen, &new.daemon.listen)
            .await?;
        if let Some(conn) = control {
            let old = std::mem::replace(&mut self.control, conn);
            info!(old = %old.local_address(), new = %self.control.local_address(), "Control address changed");
            old.close();
        }
        if let Some(conn) = listen {
            let old = std::mem::replace(&mut self.listen, conn);
            info!(old = %old.local_address(), new = %self.listen.local_address(), "Listen address changed");
            old.close();
        }

        let mut summary = ReloadSummary::default();

        let removed: Vec<String> = self
            .resources
            .iter()
            .filter(|r| new.resource(r.name()).is_none())
            .map(|r| r.name().to_string())
            .collect();
        for name in removed {
            let idx = self.index(&name)?;
            if let Err(err) = self.change_role(idx, Role::Init).await {
                warn!(resource = %name, error = %err, "Unable to demote removed resource");
            }
            self.resources.remove(idx);
            info!(resource = %name, "Resource removed");
            summary.removed.push(name);
        }

        for config in &new.resources {
            let Some(idx) = self.resources.iter().position(|r| r.name() == config.name) else {
                self.resources.push(Resource::new(config.clone()));
                info!(resource = %config.name, "Resource added");
                summary.added.push(config.name.clone());
                continue;
            };
            let res = &self.resources[idx];
            match classify_change(res.role(), res.config(), config) {
                Change::None => {}
                Change::Restart => {
                    self.restart_resource(idx, config.clone()).await;
                    summary.restarted.push(config.name.clone());
                }
                Change::Reload => {
                    self.reload_resource(idx, config.clone()).await;
                    summary.reloaded.push(config.name.clone());
                }
            }
        }

        self.config = new;
        if summary.is_empty() {
            info!("Configuration reloaded, no resource changed");
        } else {
            info!(
                added = summary.added.len(),
                removed = summary.removed.len(),
                restarted = summary.restarted.len(),
                reloaded = summary.reloaded.len(),
                "Configuration reloaded"
            );
        }
        Ok(summary)
    }

    async fn rebind(
        &self,
        what: &'static str,
        current: &str,
        wanted: &str,
    ) -> Result<Option<Conn>, DaemonError> {
        if current == wanted {
            return Ok(None);
        }
        match bind(&self.registry, what, wanted).await {
            Ok(conn) => Ok(Some(conn)),
            Err(err) => {
                error!(%what, addr = %wanted, error = %err, "Unable to bind new address, configuration not reloaded");
                Err(err)
            }
        }
    }

    async fn restart_resource(&mut self, idx: usize, config: ResourceConfig) {
        let role = self.resources[idx].role();
        info!(resource = %config.name, %role, "Local configuration changed, restarting resource");
        if let Err(err) = self.change_role(idx, Role::Init).await {
            warn!(resource = %config.name, error = %err, "Unable to demote resource");
        }
        self.resources[idx] = Resource::new(config);
        if let Err(err) = self.change_role(idx, role).await {
            error!(resource = %self.resources[idx].name(), %role, error = %err, "Unable to restore role after restart");
        }
    }

    async fn reload_resource(&mut self, idx: usize, config: ResourceConfig) {
        let res = &mut self.resources[idx];
        res.replace_config(config);
        let name = res.name().to_string();
        let config = res.config().clone();
        let Some(worker) = res.worker_mut() else {
            debug!(resource = %name, "No worker running, new settings apply on next start");
            return;
        };
        let request = CtrlRequest::reload(&config, worker.next_ctrl_seq());
        match send_reload(worker.ctrl_mut(), &request).await {
            Ok(0) => info!(resource = %name, "Worker reloaded"),
            Ok(code) => error!(resource = %name, error = code, "Worker failed to reload"),
            Err(err) => error!(resource = %name, error = %err, "Unable to deliver reload to worker"),
        }
    }
}
