//! Unix-domain socket transport.
//!
//! Claims `uds://PATH`, `unix://PATH`, and bare absolute paths. A stale
//! socket file is removed before binding, and a listener removes its own
//! file when it is closed. This is the only transport that can carry
//! descriptors.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sys::socket::{
    self, AddressFamily, Backlog, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag,
    SockType, UnixAddr,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::{LISTEN_BACKLOG, Link, PendingConnect, Side, Timeout, TransportError, stream_error};

/// Longest path that fits in `sun_path` with its terminating NUL.
const MAX_PATH_LEN: usize = 107;

/// Socket file created by a listener, identified by inode so a closing
/// listener never removes a file someone else bound since.
struct SocketFile {
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl SocketFile {
    fn record(path: &Path) -> Option<Self> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        Some(Self {
            path: path.to_path_buf(),
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    fn remove(&self) {
        let Ok(meta) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if meta.dev() != self.dev || meta.ino() != self.ino {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %err, "Unable to remove socket file");
        }
    }
}

pub(super) struct UdsContext {
    target: PathBuf,
    pub(super) link: Link<UnixStream, UnixListener>,
    socket_file: Option<SocketFile>,
}

impl Drop for UdsContext {
    fn drop(&mut self) {
        if let Some(file) = self.socket_file.take() {
            file.remove();
        }
    }
}

fn parse_addr(addr: &str) -> Result<Option<PathBuf>, TransportError> {
    let path = if let Some(path) = addr
        .strip_prefix("uds://")
        .or_else(|| addr.strip_prefix("unix://"))
    {
        path
    } else if addr.starts_with('/') && !addr.contains("://") {
        addr
    } else {
        return Ok(None);
    };
    if path.is_empty() {
        return Err(TransportError::invalid(addr, "missing path"));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(TransportError::invalid(addr, "path too long"));
    }
    Ok(Some(PathBuf::from(path)))
}

fn format_path(path: Option<&Path>) -> String {
    match path {
        Some(path) => format!("uds://{}", path.display()),
        None => "uds://<unnamed>".to_string(),
    }
}

#[allow(unsafe_code)]
fn adopt_received(raw: RawFd) -> OwnedFd {
    // SAFETY: the kernel installed `raw` in our descriptor table while
    // delivering this SCM_RIGHTS message; nothing else refers to it yet.
    unsafe { OwnedFd::from_raw_fd(raw) }
}

fn listen_on(fd: OwnedFd) -> Result<UnixListener, TransportError> {
    let backlog = Backlog::new(LISTEN_BACKLOG as i32)
        .map_err(|err| TransportError::io("listen", err))?;
    socket::listen(&fd, backlog).map_err(|err| TransportError::io("listen", err))?;
    UnixListener::from_std(std::os::unix::net::UnixListener::from(fd))
        .map_err(|err| TransportError::io("wrap", err))
}

impl UdsContext {
    pub(super) fn client(addr: &str) -> Result<Option<Self>, TransportError> {
        Ok(parse_addr(addr)?.map(|path| Self {
            target: path,
            link: Link::Idle,
            socket_file: None,
        }))
    }

    pub(super) fn server(addr: &str) -> Result<Option<Self>, TransportError> {
        let Some(path) = parse_addr(addr)? else {
            return Ok(None);
        };

        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(TransportError::io("unlink", err)),
        }

        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|err| TransportError::io("socket", err))?;
        let sockaddr =
            UnixAddr::new(path.as_path()).map_err(|err| TransportError::io("bind", err))?;
        socket::bind(fd.as_raw_fd(), &sockaddr).map_err(|err| TransportError::io("bind", err))?;

        let socket_file = SocketFile::record(&path);
        let listener = match listen_on(fd) {
            Ok(listener) => listener,
            Err(err) => {
                if let Some(file) = &socket_file {
                    file.remove();
                }
                return Err(err);
            }
        };

        Ok(Some(Self {
            target: path,
            link: Link::Listening(listener),
            socket_file,
        }))
    }

    pub(super) fn wrap(fd: OwnedFd, side: Side) -> Result<Self, TransportError> {
        if side == Side::ServerListen {
            let listener = std::os::unix::net::UnixListener::from(fd);
            listener
                .set_nonblocking(true)
                .map_err(|err| TransportError::io("fcntl", err))?;
            let listener =
                UnixListener::from_std(listener).map_err(|err| TransportError::io("wrap", err))?;
            let target = listener
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(Path::to_path_buf))
                .unwrap_or_default();
            Ok(Self {
                target,
                link: Link::Listening(listener),
                socket_file: None,
            })
        } else {
            let stream = std::os::unix::net::UnixStream::from(fd);
            stream
                .set_nonblocking(true)
                .map_err(|err| TransportError::io("fcntl", err))?;
            let stream =
                UnixStream::from_std(stream).map_err(|err| TransportError::io("wrap", err))?;
            Ok(Self {
                target: PathBuf::new(),
                link: Link::Connected(stream),
                socket_file: None,
            })
        }
    }

    pub(super) async fn connect(&mut self, timeout: Timeout) -> Result<(), TransportError> {
        let target = self.target.clone();
        self.link
            .connect(
                move || -> PendingConnect<UnixStream> { Box::pin(UnixStream::connect(target)) },
                timeout,
            )
            .await
    }

    pub(super) async fn accept(&self) -> Result<Self, TransportError> {
        let listener = self.link.listener().ok_or(TransportError::NotConnected)?;
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|err| TransportError::io("accept", err))?;
        Ok(Self {
            target: self.target.clone(),
            link: Link::Connected(stream),
            socket_file: None,
        })
    }

    /// Unix peers are normally unnamed, so an accepted connection matches
    /// `addr` when it arrived through the socket bound at that path.
    pub(super) fn address_match(&self, addr: &str) -> bool {
        let Ok(Some(path)) = parse_addr(addr) else {
            return false;
        };
        let Some(stream) = self.link.stream_ref() else {
            return false;
        };
        stream
            .local_addr()
            .ok()
            .and_then(|local| local.as_pathname().map(|local| local == path))
            .unwrap_or(false)
    }

    pub(super) fn local_address(&self) -> String {
        let addr = match &self.link {
            Link::Connected(stream) => stream.local_addr(),
            Link::Listening(listener) => listener.local_addr(),
            _ => return format_path(None),
        };
        format_path(addr.ok().as_ref().and_then(|addr| addr.as_pathname()))
    }

    pub(super) fn remote_address(&self) -> String {
        match &self.link {
            Link::Connected(stream) => {
                let peer = stream.peer_addr().ok();
                format_path(peer.as_ref().and_then(|addr| addr.as_pathname()))
            }
            _ => format_path(Some(&self.target)),
        }
    }

    pub(super) fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        match &self.link {
            Link::Connected(stream) => Some(stream.as_fd()),
            Link::Listening(listener) => Some(listener.as_fd()),
            _ => None,
        }
    }

    pub(super) fn into_fd(mut self) -> Result<OwnedFd, TransportError> {
        // The socket lives on elsewhere; leave its file in place.
        self.socket_file = None;
        match std::mem::replace(&mut self.link, Link::Idle) {
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

    pub(super) async fn descriptor_send(
        &mut self,
        payload: &[u8],
        fd: OwnedFd,
    ) -> Result<(), TransportError> {
        if payload.is_empty() {
            return Err(TransportError::io(
                "sendmsg",
                io::Error::new(io::ErrorKind::InvalidInput, "descriptor needs a payload"),
            ));
        }
        let stream = self.link.stream()?;
        let sock = stream.as_raw_fd();
        let fds = [fd.as_raw_fd()];
        let sent = stream
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(payload)];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                socket::sendmsg::<UnixAddr>(sock, &iov, &cmsgs, MsgFlags::empty(), None)
                    .map_err(io::Error::from)
            })
            .await
            .map_err(|err| stream_error("sendmsg", err))?;
        drop(fd);

        if sent < payload.len() {
            stream
                .write_all(&payload[sent..])
                .await
                .map_err(|err| stream_error("send", err))?;
        }
        Ok(())
    }

    pub(super) async fn descriptor_recv(
        &mut self,
        payload: &mut [u8],
    ) -> Result<OwnedFd, TransportError> {
        let stream = self.link.stream()?;
        let sock = stream.as_raw_fd();
        let (received, fd) = stream
            .async_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut payload[..])];
                let mut space = nix::cmsg_space!([RawFd; 1]);
                let msg = socket::recvmsg::<UnixAddr>(
                    sock,
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )?;
                let mut first = None;
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for raw in fds {
                            // Extra descriptors are closed when dropped.
                            let fd = adopt_received(raw);
                            first.get_or_insert(fd);
                        }
                    }
                }
                Ok((msg.bytes, first))
            })
            .await
            .map_err(|err| stream_error("recvmsg", err))?;

        if received == 0 && fd.is_none() {
            return Err(TransportError::NotConnected);
        }
        let fd = fd.ok_or_else(|| {
            TransportError::io(
                "recvmsg",
                io::Error::new(io::ErrorKind::InvalidData, "message carried no descriptor"),
            )
        })?;
        if received < payload.len() {
            stream
                .read_exact(&mut payload[received..])
                .await
                .map_err(|err| stream_error("recv", err))?;
        }
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Registry, Transport};

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            parse_addr("uds:///var/run/hastctl").unwrap(),
            Some(PathBuf::from("/var/run/hastctl"))
        );
        assert_eq!(
            parse_addr("unix:///var/run/hastctl").unwrap(),
            Some(PathBuf::from("/var/run/hastctl"))
        );
        assert_eq!(
            parse_addr("/var/run/hastctl").unwrap(),
            Some(PathBuf::from("/var/run/hastctl"))
        );
        assert_eq!(parse_addr("tcp://10.0.0.1").unwrap(), None);
        assert_eq!(parse_addr("relative/path").unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        assert!(parse_addr("uds://").is_err());
        let long = format!("/{}", "x".repeat(MAX_PATH_LEN));
        assert!(parse_addr(&long).is_err());
    }

    #[tokio::test]
    async fn test_listen_replaces_stale_file_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        std::fs::write(&path, b"stale").unwrap();

        let registry = Registry::new();
        let addr = format!("uds://{}", path.display());
        let listener = registry.server(&addr).await.unwrap();
        assert_eq!(listener.transport(), Transport::UnixDomain);
        assert_eq!(listener.local_address(), addr);

        listener.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_closing_listener_spares_replacement_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let registry = Registry::new();

        let old = registry.server(path.to_str().unwrap()).await.unwrap();
        let new = registry
            .server(&format!("unix://{}", path.display()))
            .await
            .unwrap();
        old.close();
        assert!(path.exists());
        new.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_connect_accept_and_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listen.sock");
        let addr = format!("uds://{}", path.display());
        let registry = Registry::new();

        let listener = registry.server(&addr).await.unwrap();
        let mut client = registry.client(&addr).unwrap();
        client.connect(Timeout::Secs(5)).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        assert!(accepted.address_match(&addr).await);
        assert!(accepted.address_match(path.to_str().unwrap()).await);
        assert!(!accepted.address_match("uds:///elsewhere.sock").await);
        assert_eq!(client.remote_address(), addr);

        client.send(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let mut client = registry
            .client(dir.path().join("absent.sock").to_str().unwrap())
            .unwrap();
        let err = client.connect(Timeout::Secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Io { op: "connect", .. }));
    }

    #[tokio::test]
    async fn test_descriptor_recv_reports_closed_peer() {
        let registry = Registry::new();
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let a = registry
            .wrap(Transport::UnixDomain, a.into(), Side::Client)
            .unwrap();
        let mut b = registry
            .wrap(Transport::UnixDomain, b.into(), Side::ServerWork)
            .unwrap();
        a.close();
        let mut name = [0u8; 4];
        assert!(matches!(
            b.descriptor_recv(&mut name).await,
            Err(TransportError::NotConnected)
        ));
    }
}
