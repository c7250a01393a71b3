//! Worker supervision: reaping, restart policy, connection migration and
//! event forwarding.

use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use super::{Daemon, DaemonError, run_role_hook};
use crate::hooks;
use crate::message::{ConnReply, ConnRequest, WorkerEvent, recv_message, send_message};
use crate::resource::{Resource, Role};
use crate::transport::{Conn, Timeout, TransportError};
use crate::worker::{self, ExitAction, RESTART_DELAY, WorkerExit, WorkerLauncher, classify_exit};

impl<L: WorkerLauncher> Daemon<L> {
    /// Collect every worker that has exited and act on how it exited.
    pub async fn reap_workers(&mut self) {
        let pids: Vec<Pid> = self
            .resources
            .iter()
            .filter_map(Resource::worker_pid)
            .collect();
        for pid in pids {
            match self.launcher.try_wait(pid) {
                Ok(Some(exit)) => {
                    self.handle_worker_exit(pid, exit).await;
                }
                Ok(None) => {}
                Err(err) => warn!(%pid, error = %err, "Unable to collect worker"),
            }
        }
    }

    /// Apply the exit policy to the resource whose worker was `pid`.
    ///
    /// Returns `None` when no resource owns `pid`.
    pub async fn handle_worker_exit(&mut self, pid: Pid, exit: WorkerExit) -> Option<ExitAction> {
        let Some(idx) = self
            .resources
            .iter()
            .position(|r| r.worker_pid() == Some(pid))
        else {
            debug!(%pid, %exit, "Exit of unknown process ignored");
            return None;
        };

        let res = &mut self.resources[idx];
        let action = classify_exit(res.role(), exit);
        if exit == WorkerExit::Exited(0) {
            info!(resource = %res.name(), %pid, "Worker exited gracefully");
        } else {
            error!(resource = %res.name(), %pid, %exit, "Worker exited");
        }
        if let Some(worker) = res.take_worker() {
            worker.close();
        }
        res.close_remote();

        match action {
            ExitAction::Release => {}
            ExitAction::Restart => {
                info!(resource = %res.name(), delay = ?RESTART_DELAY, "Restarting worker");
                tokio::time::sleep(RESTART_DELAY).await;
                let res = &mut self.resources[idx];
                if let Err(err) = worker::start(&mut self.launcher, &self.registry, res).await {
                    error!(resource = %res.name(), error = %err, "Unable to restart worker");
                    demote(res);
                }
            }
            ExitAction::Demote => demote(res),
        }
        Some(action)
    }

    /// Serve one connection request from the worker of resource `idx`.
    ///
    /// Only the daemon opens peer connections; a connected socket is passed
    /// to the worker, a failure is reported back as an errno.
    pub(crate) async fn handle_conn_request(&mut self, idx: usize) {
        let Some(chan) = self.conn_channel(idx) else {
            return;
        };
        let received = recv_message::<ConnRequest>(chan).await;
        if let Err(err) = received {
            if err.is_disconnect() {
                debug!(resource = %self.resources[idx].name(), "Worker closed its connection channel");
            } else {
                warn!(resource = %self.resources[idx].name(), error = %err, "Unable to receive connection request");
            }
            self.close_conn_channel(idx);
            return;
        }

        let res = &self.resources[idx];
        let name = res.name().to_string();
        let remote = res.config().remote.clone();
        let timeout = res.config().timeout_secs();
        let connected = self.connect_peer(&remote, timeout).await;

        let Some(chan) = self.conn_channel(idx) else {
            return;
        };
        let sent = match connected {
            Ok(conn) => {
                debug!(resource = %name, %remote, "Connected to peer for worker");
                match send_message(chan, &ConnReply { error: 0 }).await {
                    Ok(()) => chan.send_conn(conn).await.map_err(Into::into),
                    Err(err) => Err(err),
                }
            }
            Err(err) => {
                warn!(resource = %name, %remote, error = %err, "Unable to connect to peer");
                send_message(chan, &ConnReply { error: err.errno() }).await
            }
        };
        if let Err(err) = sent {
            warn!(resource = %name, error = %err, "Unable to answer connection request");
            self.close_conn_channel(idx);
        }
    }

    /// Receive one event from the worker of resource `idx` and run the hook.
    pub(crate) async fn handle_event(&mut self, idx: usize) -> Option<WorkerEvent> {
        let chan = self.resources[idx]
            .worker_mut()
            .and_then(|w| w.event_mut())?;
        let received = recv_message::<WorkerEvent>(chan).await;

        let res = &mut self.resources[idx];
        match received {
            Ok(event) => {
                info!(resource = %res.name(), %event, "Worker event");
                if let Some(program) = res.config().exec() {
                    hooks::exec(program, &[event.as_str(), res.name()]);
                }
                Some(event)
            }
            Err(err) => {
                if err.is_disconnect() {
                    debug!(resource = %res.name(), "Worker closed its event channel");
                } else {
                    warn!(resource = %res.name(), error = %err, "Unable to receive worker event");
                }
                if let Some(worker) = res.worker_mut() {
                    worker.close_event();
                }
                None
            }
        }
    }

    /// Serve the pending connection request of resource `name`.
    pub async fn serve_connection_request(&mut self, name: &str) -> Result<(), DaemonError> {
        let idx = self.index(name)?;
        self.handle_conn_request(idx).await;
        Ok(())
    }

    /// Receive the next event of resource `name`'s worker.
    pub async fn receive_event(&mut self, name: &str) -> Result<Option<WorkerEvent>, DaemonError> {
        let idx = self.index(name)?;
        Ok(self.handle_event(idx).await)
    }

    async fn connect_peer(&self, remote: &str, timeout: u64) -> Result<Conn, TransportError> {
        let mut conn = self.registry.client(remote)?;
        conn.connect(Timeout::Secs(timeout)).await?;
        Ok(conn)
    }

    fn conn_channel(&mut self, idx: usize) -> Option<&mut Conn> {
        self.resources[idx].worker_mut().and_then(|w| w.conn_mut())
    }

    fn close_conn_channel(&mut self, idx: usize) {
        if let Some(worker) = self.resources[idx].worker_mut() {
            worker.close_conn();
        }
    }
}

fn demote(res: &mut Resource) {
    let old = res.role();
    if old == Role::Init {
        return;
    }
    warn!(resource = %res.name(), %old, "Changing role to init");
    res.set_role(Role::Init);
    run_role_hook(res, old, Role::Init);
}
