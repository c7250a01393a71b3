//! Accepting side of the peer handshake.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::Daemon;
use crate::handshake::HandshakeError;
use crate::message::{HandshakeHeader, HandshakeReply, MessageError, recv_message, send_message};
use crate::resource::Role;
use crate::transport::Conn;
use crate::worker::{self, WorkerLauncher};

/// What an accepted handshake did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    /// First contact: a token was issued and the inbound socket stored.
    InboundLeg,
    /// Second leg: the outbound socket was stored and a worker started.
    SessionStarted,
}

async fn refuse(mut conn: Conn, resource: &str, err: &HandshakeError) {
    warn!(%resource, peer = %conn.remote_address(), error = %err, "Handshake refused");
    if let Err(send_err) = send_message(&mut conn, &HandshakeReply::refused(err.to_string())).await {
        debug!(%resource, error = %send_err, "Unable to send handshake refusal");
    }
    conn.close();
}

impl<L: WorkerLauncher> Daemon<L> {
    /// Accept one connection on the listen address and run the handshake.
    pub async fn accept_peer(&mut self) -> Result<PeerOutcome, HandshakeError> {
        let conn = self.listen.accept().await.map_err(MessageError::from)?;
        self.handle_peer(conn).await
    }

    pub(crate) async fn handle_peer(
        &mut self,
        mut conn: Conn,
    ) -> Result<PeerOutcome, HandshakeError> {
        let peer = conn.remote_address();
        if !self.is_known_peer(&conn).await {
            warn!(%peer, "Connection from unknown address rejected");
            conn.close();
            return Err(HandshakeError::UnknownPeer(peer));
        }

        conn.set_timeout(Some(Duration::from_secs(self.config.daemon.timeout)));
        let header: HandshakeHeader = match recv_message(&mut conn).await {
            Ok(header) => header,
            Err(err) => {
                warn!(%peer, error = %err, "Unable to receive handshake header");
                conn.close();
                return Err(err.into());
            }
        };

        let idx = match self.validate_header(&conn, &header).await {
            Ok(idx) => idx,
            Err(err) => {
                refuse(conn, &header.resource, &err).await;
                return Err(err);
            }
        };

        if header.token.is_none() {
            self.open_session(idx, conn).await
        } else {
            self.attach_outbound(idx, conn).await
        }
    }

    /// Coarse check before any payload is read: the peer must be the
    /// configured remote of at least one resource.
    async fn is_known_peer(&self, conn: &Conn) -> bool {
        for res in &self.resources {
            if conn.address_match(&res.config().remote).await {
                return true;
            }
        }
        false
    }

    /// Resolve and authorize a header without touching any resource.
    async fn validate_header(
        &self,
        conn: &Conn,
        header: &HandshakeHeader,
    ) -> Result<usize, HandshakeError> {
        let idx = self
            .resources
            .iter()
            .position(|r| r.name() == header.resource)
            .ok_or_else(|| HandshakeError::NoSuchResource(header.resource.clone()))?;
        let res = &self.resources[idx];

        if res.role() != Role::Secondary {
            return Err(HandshakeError::RoleMismatch(header.resource.clone()));
        }
        if !conn.address_match(&res.config().remote).await {
            return Err(HandshakeError::PeerMismatch {
                resource: header.resource.clone(),
                peer: conn.remote_address(),
            });
        }
        if let Some(token) = &header.token {
            if res.token() != Some(token) {
                return Err(HandshakeError::TokenMismatch);
            }
            if !res.has_remote_in() {
                return Err(HandshakeError::NoInboundLeg);
            }
            if res.worker_pid().is_some() {
                return Err(HandshakeError::SessionActive);
            }
        }
        Ok(idx)
    }

    /// First contact. At most one session exists per resource, so whatever
    /// the previous one left behind is torn down before the token is issued.
    async fn open_session(
        &mut self,
        idx: usize,
        mut conn: Conn,
    ) -> Result<PeerOutcome, HandshakeError> {
        let res = &mut self.resources[idx];
        if let Some(worker) = res.take_worker() {
            info!(resource = %res.name(), pid = %worker.pid(), "New session requested, stopping worker of the previous one");
            worker::stop(&mut self.launcher, worker, true).await;
        }
        if res.has_remote_in() || res.has_remote_out() {
            debug!(resource = %res.name(), "Dropping half-open peer connection");
        }
        res.close_remote();

        let token = res.issue_token();
        if let Err(err) = send_message(&mut conn, &HandshakeReply::accepted(token)).await {
            warn!(resource = %res.name(), error = %err, "Unable to send handshake reply");
            conn.close();
            return Err(err.into());
        }
        debug!(resource = %res.name(), peer = %conn.remote_address(), "Inbound connection established");
        res.set_remote_in(conn);
        Ok(PeerOutcome::InboundLeg)
    }

    /// Second leg: the peer connected back with the issued token.
    async fn attach_outbound(
        &mut self,
        idx: usize,
        mut conn: Conn,
    ) -> Result<PeerOutcome, HandshakeError> {
        let res = &mut self.resources[idx];
        let Some(token) = res.token().cloned() else {
            conn.close();
            return Err(HandshakeError::TokenMismatch);
        };
        if let Err(err) = send_message(&mut conn, &HandshakeReply::accepted(token)).await {
            warn!(resource = %res.name(), error = %err, "Unable to send handshake reply");
            conn.close();
            return Err(err.into());
        }
        res.set_remote_out(conn);

        if let Err(err) = worker::start(&mut self.launcher, &self.registry, res).await {
            error!(resource = %res.name(), error = %err, "Unable to start worker for the new session");
            res.close_remote();
            return Err(err.into());
        }
        info!(resource = %res.name(), "Session established");
        Ok(PeerOutcome::SessionStarted)
    }
}
