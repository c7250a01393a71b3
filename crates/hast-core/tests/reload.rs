//! Configuration reload against a running daemon.

mod common;

use std::path::Path;
use std::time::Duration;

use common::LOOPBACK;
use hast_config::{HastConfig, ReplicationMode, ResourceConfig};
use hast_core::message::{CtrlReply, CtrlRequest, WorkerEvent, recv_message, send_message};
use hast_core::worker::{WorkerChannels, receive_setup, session};
use hast_core::{Conn, Daemon, DaemonError, PeerOutcome, Role};
use hast_test_utils::config::{TestConfigBuilder, storage_file};
use hast_test_utils::daemon::TestDaemon;
use hast_test_utils::launcher::RecordingLauncher;
use nix::unistd::Pid;
use pretty_assertions::assert_eq;

const R0: (&str, &str) = ("r0", "/dev/hast-test/r0");
const R1: (&str, &str) = ("r1", "/dev/hast-test/r1");
const R2: (&str, &str) = ("r2", "/dev/hast-test/r2");

fn config(dir: &Path, resources: &[ResourceConfig]) -> HastConfig {
    resources
        .iter()
        .cloned()
        .fold(TestConfigBuilder::new(dir), |b, r| b.resource_config(r))
        .build()
}

fn resource((name, local): (&str, &str)) -> ResourceConfig {
    ResourceConfig::new(name, local, LOOPBACK)
}

/// r0 PRIMARY, r1 SECONDARY, r2 INIT.
async fn running_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[resource(R0), resource(R1), resource(R2)]);
    let mut t = TestDaemon::start(dir, config).await;
    t.daemon.set_role("r0", Role::Primary).await.unwrap();
    t.daemon.set_role("r1", Role::Secondary).await.unwrap();
    t
}

/// Act as r0's worker: take the control channel and read the setup.
async fn attach_worker(t: &mut TestDaemon) -> (Pid, Conn, WorkerChannels) {
    let pid = t.daemon.resource("r0").unwrap().worker_pid().unwrap();
    let mut ctrl = t.launcher().take_worker_end(pid).unwrap();
    let channels = receive_setup(&mut ctrl).await.unwrap();
    (pid, ctrl, channels)
}

fn role(t: &TestDaemon, name: &str) -> Role {
    t.daemon.resource(name).unwrap().role()
}

// ── No-op and in-place reloads ───────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_identical_config_is_a_no_op() {
    let mut t = running_daemon().await;
    let (pid, ctrl, _channels) = attach_worker(&mut t).await;
    let spawned = t.launcher().spawned().len();

    let same = config(t.dir(), &[resource(R0), resource(R1), resource(R2)]);
    let summary = t.daemon.apply_config(same.clone()).await.unwrap();
    assert!(summary.is_empty());

    t.write_config(&same).await;
    let summary = t.daemon.reload().await.unwrap();
    assert!(summary.is_empty());

    assert_eq!(t.launcher().spawned().len(), spawned);
    assert!(t.launcher().terminated().is_empty());
    assert_eq!(t.daemon.resource("r0").unwrap().worker_pid(), Some(pid));
    assert_eq!(role(&t, "r0"), Role::Primary);
    assert_eq!(role(&t, "r1"), Role::Secondary);
    assert_eq!(role(&t, "r2"), Role::Init);

    // No reload message was sent either.
    let pending = tokio::time::timeout(Duration::from_millis(100), ctrl.readable()).await;
    assert!(pending.is_err());
}

#[test_log::test(tokio::test)]
async fn test_peer_change_reloads_primary_worker() {
    let mut t = running_daemon().await;
    let (pid, mut ctrl, _channels) = attach_worker(&mut t).await;

    let mut r0 = resource(R0);
    r0.remote = "tcp://192.0.2.7".into();
    r0.replication = Some(ReplicationMode::Async);
    let new = config(t.dir(), &[r0, resource(R1), resource(R2)]);

    let worker = async {
        let request: CtrlRequest = recv_message(&mut ctrl).await.unwrap();
        let reply = CtrlReply {
            seq: request.seq(),
            error: 0,
        };
        send_message(&mut ctrl, &reply).await.unwrap();
        request
    };
    let (summary, request) = tokio::join!(t.daemon.apply_config(new), worker);
    let summary = summary.unwrap();

    assert_eq!(summary.reloaded, vec!["r0".to_string()]);
    assert!(summary.restarted.is_empty());
    assert_eq!(
        request,
        CtrlRequest::Reload {
            seq: 1,
            remoteaddr: "tcp://192.0.2.7".into(),
            replication: ReplicationMode::Async.as_i32(),
            timeout: 5,
            exec: String::new(),
        }
    );
    assert_eq!(t.daemon.resource("r0").unwrap().worker_pid(), Some(pid));
    assert_eq!(t.daemon.resource("r0").unwrap().config().remote, "tcp://192.0.2.7");
    assert_eq!(t.launcher().spawn_count("r0"), 1);
    assert!(t.launcher().terminated().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_refused_reload_keeps_worker() {
    let mut t = running_daemon().await;
    let (pid, mut ctrl, _channels) = attach_worker(&mut t).await;

    let mut r0 = resource(R0);
    r0.timeout = Some(9);
    let new = config(t.dir(), &[r0, resource(R1), resource(R2)]);

    let worker = async {
        let request: CtrlRequest = recv_message(&mut ctrl).await.unwrap();
        let reply = CtrlReply {
            seq: request.seq(),
            error: 22,
        };
        send_message(&mut ctrl, &reply).await.unwrap();
    };
    let (summary, ()) = tokio::join!(t.daemon.apply_config(new), worker);
    assert_eq!(summary.unwrap().reloaded, vec!["r0".to_string()]);
    assert_eq!(t.daemon.resource("r0").unwrap().worker_pid(), Some(pid));
    assert_eq!(t.daemon.resource("r0").unwrap().config().timeout_secs(), 9);
}

#[test_log::test(tokio::test)]
async fn test_late_reply_is_not_taken_for_next_reload() {
    let mut t = running_daemon().await;
    let (_pid, mut ctrl, _channels) = attach_worker(&mut t).await;

    let mut r0 = resource(R0);
    r0.timeout = Some(9);
    let new = config(t.dir(), &[r0, resource(R1), resource(R2)]);

    // The answer to an earlier request arrives first and is skipped.
    let worker = async {
        let request: CtrlRequest = recv_message(&mut ctrl).await.unwrap();
        assert_eq!(request.seq(), 1);
        let stale = CtrlReply { seq: 0, error: 22 };
        send_message(&mut ctrl, &stale).await.unwrap();
        let reply = CtrlReply { seq: 1, error: 0 };
        send_message(&mut ctrl, &reply).await.unwrap();
    };
    let (summary, ()) = tokio::join!(t.daemon.apply_config(new), worker);
    assert_eq!(summary.unwrap().reloaded, vec!["r0".to_string()]);

    // Nothing is left unread on the channel.
    let pending = tokio::time::timeout(Duration::from_millis(100), ctrl.readable()).await;
    assert!(pending.is_err());

    let mut r0 = resource(R0);
    r0.timeout = Some(10);
    let new = config(t.dir(), &[r0, resource(R1), resource(R2)]);
    let worker = async {
        let request: CtrlRequest = recv_message(&mut ctrl).await.unwrap();
        assert_eq!(request.seq(), 2);
        let reply = CtrlReply { seq: 2, error: 0 };
        send_message(&mut ctrl, &reply).await.unwrap();
    };
    let (summary, ()) = tokio::join!(t.daemon.apply_config(new), worker);
    assert_eq!(summary.unwrap().reloaded, vec!["r0".to_string()]);
}

#[test_log::test(tokio::test)]
async fn test_reload_answered_while_worker_connects() {
    let mut secondary = common::secondary_daemon().await;
    let dir = tempfile::tempdir().unwrap();
    let local = storage_file(dir.path(), "r0");
    let remote = secondary.daemon.listen_address();
    let with_timeout = |secs: u64| {
        let mut r0 = ResourceConfig::new("r0", &local, &remote);
        r0.timeout = Some(secs);
        config(dir.path(), &[r0])
    };
    let (first, second, third) = (with_timeout(5), with_timeout(6), with_timeout(7));

    let mut primary = TestDaemon::start(dir, first).await;
    primary.daemon.set_role("r0", Role::Primary).await.unwrap();
    let pid = primary.daemon.resource("r0").unwrap().worker_pid().unwrap();
    let worker_end = primary.launcher().take_worker_end(pid).unwrap();
    let primary_worker = session::serve(worker_end);

    let driver = async {
        // The worker's first connection request is still unanswered.
        let summary = tokio::time::timeout(
            Duration::from_secs(2),
            primary.daemon.apply_config(second),
        )
        .await
        .expect("reload waited on a connecting worker")
        .unwrap();
        assert_eq!(summary.reloaded, vec!["r0".to_string()]);

        primary
            .daemon
            .serve_connection_request("r0")
            .await
            .unwrap();
        assert_eq!(
            secondary.daemon.accept_peer().await.unwrap(),
            PeerOutcome::InboundLeg
        );
        primary
            .daemon
            .serve_connection_request("r0")
            .await
            .unwrap();
        assert_eq!(
            secondary.daemon.accept_peer().await.unwrap(),
            PeerOutcome::SessionStarted
        );
        assert_eq!(
            primary.daemon.receive_event("r0").await.unwrap(),
            Some(WorkerEvent::Connect)
        );

        // Request and reply stay paired once the session is up.
        let summary = tokio::time::timeout(
            Duration::from_secs(2),
            primary.daemon.apply_config(third),
        )
        .await
        .expect("reload reply out of step")
        .unwrap();
        assert_eq!(summary.reloaded, vec!["r0".to_string()]);
    };

    tokio::select! {
        status = primary_worker => panic!("primary worker exited early with {status}"),
        () = driver => {}
    }

    let r0 = primary.daemon.resource("r0").unwrap();
    assert_eq!(r0.worker_pid(), Some(pid));
    assert_eq!(r0.config().timeout_secs(), 7);
    assert_eq!(primary.launcher().spawn_count("r0"), 1);
    assert!(primary.launcher().terminated().is_empty());
}

// ── Restarts ─────────────────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_local_change_restarts_in_every_role() {
    let mut t = running_daemon().await;
    let old_pid = t.daemon.resource("r0").unwrap().worker_pid().unwrap();

    let new = config(
        t.dir(),
        &[
            resource(("r0", "/dev/hast-test/r0-new")),
            resource(("r1", "/dev/hast-test/r1-new")),
            resource(("r2", "/dev/hast-test/r2-new")),
        ],
    );
    let summary = t.daemon.apply_config(new).await.unwrap();
    assert_eq!(
        summary.restarted,
        vec!["r0".to_string(), "r1".to_string(), "r2".to_string()]
    );
    assert!(summary.reloaded.is_empty());

    // PRIMARY came back with a new worker on the new storage.
    assert_eq!(t.launcher().terminated(), &[old_pid]);
    let r0 = t.daemon.resource("r0").unwrap();
    assert_eq!(r0.role(), Role::Primary);
    assert_ne!(r0.worker_pid(), Some(old_pid));
    assert!(r0.worker_pid().is_some());
    assert_eq!(r0.config().local, "/dev/hast-test/r0-new");
    assert_eq!(t.launcher().spawn_count("r0"), 2);

    // SECONDARY and INIT keep their role without spawning anything.
    assert_eq!(role(&t, "r1"), Role::Secondary);
    assert_eq!(role(&t, "r2"), Role::Init);
    assert_eq!(t.launcher().spawn_count("r1"), 0);
    assert_eq!(t.daemon.resource("r1").unwrap().config().local, "/dev/hast-test/r1-new");
}

#[test_log::test(tokio::test)]
async fn test_peer_change_restarts_secondary() {
    let mut t = running_daemon().await;

    let mut r1 = resource(R1);
    r1.remote = "tcp://192.0.2.8".into();
    let new = config(t.dir(), &[resource(R0), r1, resource(R2)]);
    let summary = t.daemon.apply_config(new).await.unwrap();

    assert_eq!(summary.restarted, vec!["r1".to_string()]);
    let r1 = t.daemon.resource("r1").unwrap();
    assert_eq!(r1.role(), Role::Secondary);
    assert_eq!(r1.config().remote, "tcp://192.0.2.8");
    assert!(r1.token().is_none());
}

// ── Added and removed resources ──────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_removed_resource_is_demoted_and_dropped() {
    let mut t = running_daemon().await;
    let pid = t.daemon.resource("r0").unwrap().worker_pid().unwrap();

    let new = config(
        t.dir(),
        &[resource(R1), resource(R2), resource(("r3", "/dev/hast-test/r3"))],
    );
    let summary = t.daemon.apply_config(new.clone()).await.unwrap();

    assert_eq!(summary.removed, vec!["r0".to_string()]);
    assert_eq!(summary.added, vec!["r3".to_string()]);
    assert_eq!(t.launcher().terminated(), &[pid]);
    assert!(t.daemon.resource("r0").is_none());
    assert_eq!(role(&t, "r3"), Role::Init);

    let names: Vec<&str> = t.daemon.resources().iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["r1", "r2", "r3"]);
    assert_eq!(t.daemon.config(), &new);
}

// ── Listening addresses ──────────────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_control_address_moves() {
    let mut t = running_daemon().await;
    let old_path = t.dir().join("hastctl");
    let new_path = t.dir().join("hastctl.new");
    assert!(old_path.exists());

    let new = TestConfigBuilder::new(t.dir())
        .control(&format!("uds://{}", new_path.display()))
        .resource_config(resource(R0))
        .resource_config(resource(R1))
        .resource_config(resource(R2))
        .build();
    let summary = t.daemon.apply_config(new).await.unwrap();

    assert!(summary.is_empty());
    assert!(t.daemon.control_address().ends_with("hastctl.new"));
    assert!(new_path.exists());
    assert!(!old_path.exists());
}

#[test_log::test(tokio::test)]
async fn test_bind_failure_aborts_whole_reload() {
    let mut t = running_daemon().await;
    let pid = t.daemon.resource("r0").unwrap().worker_pid().unwrap();
    let control = t.daemon.control_address();
    let before = t.daemon.config().clone();

    let new = TestConfigBuilder::new(t.dir())
        .control("uds:///nonexistent-hast-dir/hastctl")
        .resource_config(resource(("r0", "/dev/hast-test/r0-new")))
        .build();
    let result = t.daemon.apply_config(new).await;

    assert!(matches!(result, Err(DaemonError::Bind { what: "control", .. })));
    assert_eq!(t.daemon.control_address(), control);
    assert_eq!(t.daemon.config(), &before);
    assert_eq!(t.daemon.resources().len(), 3);
    assert_eq!(t.daemon.resource("r0").unwrap().worker_pid(), Some(pid));
    assert!(t.launcher().terminated().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_invalid_config_is_rejected() {
    let mut t = running_daemon().await;
    let new = config(t.dir(), &[resource(R0), resource(R0)]);
    let result = t.daemon.apply_config(new).await;
    assert!(matches!(result, Err(DaemonError::Config(_))));
    assert_eq!(t.daemon.resources().len(), 3);
}

// ── Startup ──────────────────────────────────────────────────────

/// `config` as read from a file, before resource defaults are filled in.
fn unresolved(dir: &Path, resources: &[ResourceConfig]) -> HastConfig {
    let mut config = config(dir, resources);
    for res in &mut config.resources {
        res.provider = None;
        res.replication = None;
        res.timeout = None;
        res.exec = None;
    }
    config
}

#[test_log::test(tokio::test)]
async fn test_start_resolves_resource_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let parsed = unresolved(dir.path(), &[resource(R0), resource(R1)]);
    let mut t = TestDaemon::start(dir, parsed.clone()).await;

    let r0 = t.daemon.resource("r0").unwrap().config();
    assert_eq!(r0.timeout, Some(5));
    assert_eq!(r0.provider.as_deref(), Some("r0"));

    t.daemon.set_role("r0", Role::Primary).await.unwrap();
    let pid = t.daemon.resource("r0").unwrap().worker_pid();

    // Re-reading the same file changes nothing.
    let summary = t.daemon.apply_config(parsed).await.unwrap();
    assert!(summary.is_empty());
    assert_eq!(t.daemon.resource("r0").unwrap().worker_pid(), pid);
    assert_eq!(t.launcher().spawn_count("r0"), 1);
    assert!(t.launcher().terminated().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_start_rejects_duplicate_names() {
    let dir = tempfile::tempdir().unwrap();
    let duplicated = config(dir.path(), &[resource(R0), resource(R0)]);
    let result = Daemon::start(duplicated, None, RecordingLauncher::new()).await;
    assert!(matches!(result, Err(DaemonError::Config(_))));
    // Nothing was bound.
    assert!(!dir.path().join("hastctl").exists());
}

#[test_log::test(tokio::test)]
async fn test_reload_without_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[resource(R0)]);
    let mut daemon = Daemon::start(config, None, RecordingLauncher::new())
        .await
        .unwrap();
    assert!(matches!(
        daemon.reload().await,
        Err(DaemonError::NoConfigPath)
    ));
}
