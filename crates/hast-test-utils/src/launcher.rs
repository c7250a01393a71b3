//! In-process [`WorkerLauncher`] for daemon tests.
//!
//! [`RecordingLauncher`] hands out fake pids and never forks. The worker end
//! of every control channel is kept so a test can act as the worker, either
//! by hand or by running [`hast_core::worker::session::serve`] on it.

use std::collections::HashMap;
use std::io;
use std::os::unix::net::UnixStream;

use hast_config::ResourceConfig;
use hast_core::worker::{Spawned, WorkerError};
use hast_core::{Conn, Registry, Role, Side, Transport, WorkerExit, WorkerLauncher};
use nix::unistd::Pid;
use tracing::debug;

/// First pid handed out; well above anything a test host is likely to use.
pub const FIRST_PID: i32 = 100_000;

/// One call to [`WorkerLauncher::spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRecord {
    pub pid: Pid,
    pub name: String,
    pub role: Role,
}

#[derive(Debug)]
pub struct RecordingLauncher {
    next_pid: i32,
    spawned: Vec<SpawnRecord>,
    terminated: Vec<Pid>,
    killed: Vec<Pid>,
    exits: HashMap<Pid, WorkerExit>,
    worker_ends: HashMap<Pid, Conn>,
    exit_on_terminate: bool,
    fail_spawn: bool,
}

impl Default for RecordingLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: FIRST_PID,
            spawned: Vec::new(),
            terminated: Vec::new(),
            killed: Vec::new(),
            exits: HashMap::new(),
            worker_ends: HashMap::new(),
            exit_on_terminate: true,
            fail_spawn: false,
        }
    }

    /// Workers ignore SIGTERM and only go away when killed.
    pub fn ignore_terminate(mut self) -> Self {
        self.exit_on_terminate = false;
        self
    }

    /// Make every later spawn fail.
    pub fn set_fail_spawn(&mut self, fail: bool) {
        self.fail_spawn = fail;
    }

    pub fn spawned(&self) -> &[SpawnRecord] {
        &self.spawned
    }

    pub fn spawn_count(&self, name: &str) -> usize {
        self.spawned.iter().filter(|s| s.name == name).count()
    }

    pub fn terminated(&self) -> &[Pid] {
        &self.terminated
    }

    pub fn killed(&self) -> &[Pid] {
        &self.killed
    }

    /// Report `exit` for `pid` on the next [`WorkerLauncher::try_wait`].
    pub fn set_exit(&mut self, pid: Pid, exit: WorkerExit) {
        self.exits.insert(pid, exit);
    }

    /// Take the worker end of `pid`'s control channel.
    pub fn take_worker_end(&mut self, pid: Pid) -> Option<Conn> {
        self.worker_ends.remove(&pid)
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn spawn(
        &mut self,
        registry: &Registry,
        config: &ResourceConfig,
        role: Role,
    ) -> Result<Spawned, WorkerError> {
        if self.fail_spawn {
            return Err(WorkerError::Spawn(io::Error::other("spawn disabled by test")));
        }
        let (ours, theirs) = UnixStream::pair().map_err(WorkerError::Spawn)?;
        let ctrl = registry.wrap(Transport::UnixDomain, ours.into(), Side::Client)?;
        let worker_end = registry.wrap(Transport::UnixDomain, theirs.into(), Side::ServerWork)?;

        let pid = Pid::from_raw(self.next_pid);
        self.next_pid += 1;
        self.spawned.push(SpawnRecord {
            pid,
            name: config.name.clone(),
            role,
        });
        self.worker_ends.insert(pid, worker_end);
        debug!(%pid, resource = %config.name, %role, "Recorded worker spawn");
        Ok(Spawned { pid, ctrl })
    }

    fn terminate(&mut self, pid: Pid) -> Result<(), WorkerError> {
        debug!(%pid, exits = self.exit_on_terminate, "Recorded SIGTERM");
        self.terminated.push(pid);
        if self.exit_on_terminate {
            self.exits.entry(pid).or_insert(WorkerExit::Exited(0));
        }
        Ok(())
    }

    fn kill(&mut self, pid: Pid) -> Result<(), WorkerError> {
        debug!(%pid, "Recorded SIGKILL");
        self.killed.push(pid);
        self.exits.insert(pid, WorkerExit::Signaled(9));
        Ok(())
    }

    fn try_wait(&mut self, pid: Pid) -> Result<Option<WorkerExit>, WorkerError> {
        Ok(self.exits.get(&pid).copied())
    }
}
