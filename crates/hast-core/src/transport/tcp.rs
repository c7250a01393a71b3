//! TCP transport.
//!
//! Claims `tcp://host[:port]` and bare `host[:port]` addresses; IPv6 hosts
//! are written in brackets. Any other `scheme://` is declined. The port
//! defaults to [`DEFAULT_PORT`].

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use hast_config::DEFAULT_PORT;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use super::{LISTEN_BACKLOG, Link, PendingConnect, Side, Timeout, TransportError};

pub(super) struct TcpContext {
    /// `host:port` the client connects to.
    target: String,
    pub(super) link: Link<TcpStream, TcpListener>,
}

/// Split `addr` into host and port, or `None` when it is not a TCP address.
fn parse_addr(addr: &str) -> Result<Option<(String, u16)>, TransportError> {
    let rest = match addr.strip_prefix("tcp://") {
        Some(rest) => rest,
        None if addr.contains("://") => return Ok(None),
        None => addr,
    };
    if rest.is_empty() {
        return Err(TransportError::invalid(addr, "missing host"));
    }

    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| TransportError::invalid(addr, "bad port"))
    };

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| TransportError::invalid(addr, "unterminated '['"))?;
        let port = match tail {
            "" => DEFAULT_PORT,
            tail => parse_port(
                tail.strip_prefix(':')
                    .ok_or_else(|| TransportError::invalid(addr, "junk after ']'"))?,
            )?,
        };
        (host, port)
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, parse_port(port)?),
            // Bare IPv6 literal without a port.
            Some(_) => (rest, DEFAULT_PORT),
            None => (rest, DEFAULT_PORT),
        }
    };

    if host.is_empty() {
        return Err(TransportError::invalid(addr, "missing host"));
    }
    Ok(Some((host.to_string(), port)))
}

fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn format_addr(addr: io::Result<SocketAddr>) -> String {
    match addr {
        Ok(addr) => format!("tcp://{addr}"),
        Err(_) => "tcp://<unknown>".to_string(),
    }
}

impl TcpContext {
    pub(super) fn client(addr: &str) -> Result<Option<Self>, TransportError> {
        Ok(parse_addr(addr)?.map(|(host, port)| Self {
            target: format_target(&host, port),
            link: Link::Idle,
        }))
    }

    pub(super) async fn server(addr: &str) -> Result<Option<Self>, TransportError> {
        let Some((host, port)) = parse_addr(addr)? else {
            return Ok(None);
        };
        let bind_addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|err| TransportError::io("resolve", err))?
            .next()
            .ok_or_else(|| TransportError::invalid(addr, "host did not resolve"))?;

        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|err| TransportError::io("socket", err))?;
        if let Err(err) = socket.set_reuseaddr(true) {
            debug!(%bind_addr, error = %err, "SO_REUSEADDR not applied");
        }
        socket
            .bind(bind_addr)
            .map_err(|err| TransportError::io("bind", err))?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|err| TransportError::io("listen", err))?;

        Ok(Some(Self {
            target: format_target(&host, port),
            link: Link::Listening(listener),
        }))
    }

    pub(super) fn wrap(fd: OwnedFd, side: Side) -> Result<Self, TransportError> {
        if side == Side::ServerListen {
            let listener = std::net::TcpListener::from(fd);
            listener
                .set_nonblocking(true)
                .map_err(|err| TransportError::io("fcntl", err))?;
            let listener =
                TcpListener::from_std(listener).map_err(|err| TransportError::io("wrap", err))?;
            Ok(Self {
                target: listener
                    .local_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_default(),
                link: Link::Listening(listener),
            })
        } else {
            let stream = std::net::TcpStream::from(fd);
            stream
                .set_nonblocking(true)
                .map_err(|err| TransportError::io("fcntl", err))?;
            let stream =
                TcpStream::from_std(stream).map_err(|err| TransportError::io("wrap", err))?;
            Ok(Self {
                target: stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_default(),
                link: Link::Connected(stream),
            })
        }
    }

    pub(super) async fn connect(&mut self, timeout: Timeout) -> Result<(), TransportError> {
        let target = self.target.clone();
        self.link
            .connect(
                move || -> PendingConnect<TcpStream> { Box::pin(TcpStream::connect(target)) },
                timeout,
            )
            .await?;
        if let Some(stream) = self.link.stream_ref()
            && let Err(err) = stream.set_nodelay(true)
        {
            debug!(addr = %self.target, error = %err, "TCP_NODELAY not applied");
        }
        Ok(())
    }

    pub(super) async fn accept(&self) -> Result<Self, TransportError> {
        let listener = self.link.listener().ok_or(TransportError::NotConnected)?;
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|err| TransportError::io("accept", err))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "TCP_NODELAY not applied");
        }
        Ok(Self {
            target: peer.to_string(),
            link: Link::Connected(stream),
        })
    }

    /// Whether the connected peer's IP is one `addr` resolves to. Ports are
    /// ignored: the peer connects from an ephemeral one.
    pub(super) async fn address_match(&self, addr: &str) -> bool {
        let Some(stream) = self.link.stream_ref() else {
            return false;
        };
        let Ok(peer) = stream.peer_addr() else {
            return false;
        };
        let Ok(Some((host, port))) = parse_addr(addr) else {
            return false;
        };
        match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(mut resolved) => {
                let peer_ip = peer.ip().to_canonical();
                resolved.any(|candidate| candidate.ip().to_canonical() == peer_ip)
            }
            Err(err) => {
                debug!(%addr, error = %err, "Unable to resolve address for matching");
                false
            }
        }
    }

    pub(super) fn local_address(&self) -> String {
        match &self.link {
            Link::Connected(stream) => format_addr(stream.local_addr()),
            Link::Listening(listener) => format_addr(listener.local_addr()),
            _ => "tcp://<unbound>".to_string(),
        }
    }

    pub(super) fn remote_address(&self) -> String {
        match &self.link {
            Link::Connected(stream) => format_addr(stream.peer_addr()),
            _ => format!("tcp://{}", self.target),
        }
    }

    pub(super) fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        match &self.link {
            Link::Connected(stream) => Some(stream.as_fd()),
            Link::Listening(listener) => Some(listener.as_fd()),
            _ => None,
        }
    }

    pub(super) fn into_fd(self) -> Result<OwnedFd, TransportError> {
        match self.link {
            Link::Connected(stream) => {
                let stream = stream
                    .into_std()
                    .map_err(|err| TransportError::io("into_std", err))?;
                stream
                    .set_nonblocking(false)
                    .map_err(|err| TransportError::io("fcntl", err))?;
                Ok(stream.into())
            }
            Link::Listening(listener) => {
                let listener = listener
                    .into_std()
                    .map_err(|err| TransportError::io("into_std", err))?;
                listener
                    .set_nonblocking(false)
                    .map_err(|err| TransportError::io("fcntl", err))?;
                Ok(listener.into())
            }
            _ => Err(TransportError::NotConnected),
        }
    }
}
