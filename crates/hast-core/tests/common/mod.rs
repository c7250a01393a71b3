//! Helpers shared by the daemon integration tests.

#![allow(dead_code)]

use hast_core::handshake::{HandshakeError, client_leg};
use hast_core::{Conn, PeerOutcome, Registry, Role, Timeout, Token};
use hast_test_utils::config::{TestConfigBuilder, storage_file};
use hast_test_utils::daemon::TestDaemon;
use nix::unistd::Pid;

/// Address the tests connect from, as configured on the accepting side.
pub const LOOPBACK: &str = "tcp://127.0.0.1";

/// Daemon with one resource `r0` whose peer is this host.
pub async fn local_peer_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::new(dir.path())
        .resource("r0", &storage_file(dir.path(), "r0"), LOOPBACK)
        .build();
    TestDaemon::start(dir, config).await
}

/// Same as [`local_peer_daemon`] with `r0` already SECONDARY.
pub async fn secondary_daemon() -> TestDaemon {
    let mut t = local_peer_daemon().await;
    t.daemon.set_role("r0", Role::Secondary).await.unwrap();
    t
}

/// Connect to the daemon's listen address.
pub async fn dial(registry: &Registry, t: &TestDaemon) -> Conn {
    let mut conn = registry.client(&t.daemon.listen_address()).unwrap();
    conn.connect(Timeout::Secs(5)).await.unwrap();
    conn
}

/// Run one handshake leg against `t` as the primary would.
pub async fn leg(
    t: &mut TestDaemon,
    registry: &Registry,
    resource: &str,
    token: Option<&Token>,
) -> (
    Result<PeerOutcome, HandshakeError>,
    Result<Token, HandshakeError>,
    Conn,
) {
    let mut conn = dial(registry, t).await;
    let (outcome, reply) = tokio::join!(
        t.daemon.accept_peer(),
        client_leg(&mut conn, resource, token)
    );
    (outcome, reply, conn)
}

/// Complete both legs for `r0` and return the primary's ends, the token and
/// the pid of the secondary worker.
pub async fn open_session(t: &mut TestDaemon, registry: &Registry) -> (Conn, Conn, Token, Pid) {
    let (outcome, token, outbound) = leg(t, registry, "r0", None).await;
    assert_eq!(outcome.unwrap(), PeerOutcome::InboundLeg);
    let token = token.unwrap();

    let (outcome, echoed, inbound) = leg(t, registry, "r0", Some(&token)).await;
    assert_eq!(outcome.unwrap(), PeerOutcome::SessionStarted);
    assert_eq!(echoed.unwrap(), token);

    let pid = t.daemon.resource("r0").unwrap().worker_pid().unwrap();
    (outbound, inbound, token, pid)
}
