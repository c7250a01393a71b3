//! Daemon side of the control socket.

use tracing::{debug, error, warn};

use super::{Daemon, DaemonError};
use crate::control::{ControlReply, ControlRequest, DEFAULT_CONTROL_TIMEOUT};
use crate::message::{recv_message, send_message};
use crate::transport::{Conn, TransportError};
use crate::worker::WorkerLauncher;

impl<L: WorkerLauncher> Daemon<L> {
    /// Accept and serve one control connection.
    pub async fn accept_control(&mut self) -> Result<(), TransportError> {
        let conn = self.control.accept().await?;
        self.handle_control(conn).await;
        Ok(())
    }

    pub(crate) async fn handle_control(&mut self, mut conn: Conn) {
        conn.set_timeout(Some(DEFAULT_CONTROL_TIMEOUT));
        let request: ControlRequest = match recv_message(&mut conn).await {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Unable to receive control request");
                conn.close();
                return;
            }
        };
        debug!(?request, "Control request");

        let reply = self.execute_control(request).await;
        if let Err(err) = send_message(&mut conn, &reply).await {
            warn!(error = %err, "Unable to send control reply");
        }
        conn.close();
    }

    /// Carry out one control request.
    ///
    /// A role change names every resource up front; if any name is unknown
    /// nothing is changed.
    pub async fn execute_control(&mut self, request: ControlRequest) -> ControlReply {
        match request {
            ControlRequest::Status { names } => match self.status(&names) {
                Ok(resources) => ControlReply::ok(resources),
                Err(err) => ControlReply::failed(err.errno(), err.to_string(), Vec::new()),
            },
            ControlRequest::SetRole { names, role } => {
                let names: Vec<String> = if names.is_empty() {
                    self.resources.iter().map(|r| r.name().to_string()).collect()
                } else {
                    names
                };
                if let Some(missing) = names.iter().find(|n| self.resource(n).is_none()) {
                    let err = DaemonError::NoSuchResource(missing.clone());
                    return ControlReply::failed(err.errno(), err.to_string(), Vec::new());
                }

                let mut failure: Option<DaemonError> = None;
                for name in &names {
                    if let Err(err) = self.set_role(name, role).await {
                        error!(resource = %name, %role, error = %err, "Unable to change role");
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                }
                let resources = self.status(&names).unwrap_or_default();
                match failure {
                    None => ControlReply::ok(resources),
                    Some(err) => ControlReply::failed(err.errno(), err.to_string(), resources),
                }
            }
        }
    }
}
