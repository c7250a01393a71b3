//! Address-driven connection transports.
//!
//! A [`Registry`] holds the known transports in probe order. Opening a
//! connection offers the address to each transport in turn: the first one
//! that claims it wins, and one that declines passes the address on. TCP is
//! registered last and accepts anything shaped like `host[:port]`, so it acts
//! as the default.
//!
//! Every open [`Conn`] is counted by the registry that created it;
//! [`Registry::open_handles`] lets callers check that error paths release
//! exactly what they opened.
//!
//! ## Descriptor passing
//!
//! Unix-domain connections can carry another connection's descriptor
//! ([`Conn::send_conn`] / [`Conn::recv_conn`]). The payload accompanying the
//! descriptor is the transport name, so the receiver can wrap it with the
//! right transport. A descriptor leaving a handle through [`Conn::into_fd`]
//! is switched back to blocking mode; [`Registry::wrap`] makes it
//! non-blocking again on the way in.

mod tcp;
mod uds;

use std::fmt;
use std::future::Future;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use tcp::TcpContext;
use uds::UdsContext;

/// Listen backlog used by every server socket.
pub const LISTEN_BACKLOG: u32 = 8;

/// Bytes reserved for the transport name that accompanies a passed descriptor.
const NAME_LEN: usize = 8;

/// A registered connection transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    UnixDomain,
    Tcp,
}

impl Transport {
    /// Short name, also used as the URL scheme.
    pub fn name(self) -> &'static str {
        match self {
            Self::UnixDomain => "uds",
            Self::Tcp => "tcp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "uds" => Some(Self::UnixDomain),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which end of a connection a handle represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Outgoing connection, created by [`Registry::client`].
    Client,
    /// Listening socket, created by [`Registry::server`].
    ServerListen,
    /// Connection accepted from a listening socket.
    ServerWork,
}

/// How long a connect may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until the connect finishes.
    Block,
    /// Start the connect and return at once; finish it with [`Conn::connect_wait`].
    Poll,
    /// Give up after this many seconds.
    Secs(u64),
}

impl Timeout {
    /// Integer convention used on the wire: negative blocks, zero polls.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            s if s < 0 => Self::Block,
            0 => Self::Poll,
            s => Self::Secs(s.unsigned_abs()),
        }
    }

    fn limit(self) -> Option<Duration> {
        match self {
            Self::Block => None,
            Self::Poll => Some(Duration::ZERO),
            Self::Secs(secs) => Some(Duration::from_secs(secs)),
        }
    }
}

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no transport recognizes address {0:?}")]
    AddressNotRecognized(String),

    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: &'static str },

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("connect still in progress")]
    InProgress,

    #[error("not connected")]
    NotConnected,

    #[error("{op} is not supported by the {transport} transport")]
    Unsupported {
        op: &'static str,
        transport: Transport,
    },

    #[error("{op} is not valid on a {side:?} handle")]
    WrongSide { op: &'static str, side: Side },
}

impl TransportError {
    pub(crate) fn io(op: &'static str, source: impl Into<io::Error>) -> Self {
        Self::Io {
            op,
            source: source.into(),
        }
    }

    pub(crate) fn invalid(addr: &str, reason: &'static str) -> Self {
        Self::InvalidAddress {
            addr: addr.to_string(),
            reason,
        }
    }

    /// errno equivalent, for replies that carry an integer error code.
    pub fn errno(&self) -> i32 {
        let errno = match self {
            Self::AddressNotRecognized(_) | Self::InvalidAddress { .. } => Errno::EINVAL,
            Self::WrongSide { .. } => Errno::EINVAL,
            Self::Io { source, .. } => {
                return source.raw_os_error().unwrap_or(Errno::EIO as i32);
            }
            Self::Timeout => Errno::ETIMEDOUT,
            Self::InProgress => Errno::EINPROGRESS,
            Self::NotConnected => Errno::ENOTCONN,
            Self::Unsupported { .. } => Errno::EOPNOTSUPP,
        };
        errno as i32
    }
}

/// Map a stream I/O error, folding the "peer went away" family into
/// [`TransportError::NotConnected`].
fn stream_error(op: &'static str, err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset => TransportError::NotConnected,
        _ => TransportError::io(op, err),
    }
}

async fn limited<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::Timeout)?,
        None => fut.await,
    }
}

/// Byte stream a connected handle reads and writes through.
trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

type PendingConnect<S> = Pin<Box<dyn Future<Output = io::Result<S>> + Send>>;

/// Connection state shared by the stream transports.
enum Link<S, L> {
    /// Client handle that has not started connecting.
    Idle,
    Connecting(PendingConnect<S>),
    Connected(S),
    Listening(L),
}

impl<S: Send + 'static, L> Link<S, L> {
    async fn connect(
        &mut self,
        start: impl FnOnce() -> PendingConnect<S>,
        timeout: Timeout,
    ) -> Result<(), TransportError> {
        match std::mem::replace(self, Link::Idle) {
            Link::Idle => self.finish(start(), timeout).await,
            Link::Connecting(pending) => {
                *self = Link::Connecting(pending);
                Err(TransportError::InProgress)
            }
            other => {
                *self = other;
                Err(TransportError::io("connect", Errno::EISCONN))
            }
        }
    }

    async fn connect_wait(&mut self, timeout: Timeout) -> Result<(), TransportError> {
        match std::mem::replace(self, Link::Idle) {
            Link::Connecting(pending) => self.finish(pending, timeout).await,
            Link::Connected(stream) => {
                *self = Link::Connected(stream);
                Ok(())
            }
            other => {
                *self = other;
                Err(TransportError::NotConnected)
            }
        }
    }

    async fn finish(
        &mut self,
        mut pending: PendingConnect<S>,
        timeout: Timeout,
    ) -> Result<(), TransportError> {
        let outcome = match timeout.limit() {
            None => Some((&mut pending).await),
            Some(limit) => tokio::time::timeout(limit, &mut pending).await.ok(),
        };
        match outcome {
            Some(Ok(stream)) => {
                *self = Link::Connected(stream);
                Ok(())
            }
            Some(Err(err)) => Err(TransportError::io("connect", err)),
            None if timeout == Timeout::Poll => {
                *self = Link::Connecting(pending);
                Err(TransportError::InProgress)
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn stream(&mut self) -> Result<&mut S, TransportError> {
        match self {
            Link::Connected(stream) => Ok(stream),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn stream_ref(&self) -> Option<&S> {
        match self {
            Link::Connected(stream) => Some(stream),
            _ => None,
        }
    }

    fn listener(&self) -> Option<&L> {
        match self {
            Link::Listening(listener) => Some(listener),
            _ => None,
        }
    }
}

/// Keeps the registry's live-handle count in step with open handles.
#[derive(Debug)]
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }

    fn share(&self) -> Self {
        Self::new(&self.0)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Context {
    Tcp(TcpContext),
    Uds(UdsContext),
}

/// The set of transports connections are opened through.
#[derive(Debug, Clone)]
pub struct Registry {
    transports: Vec<Transport>,
    live: Arc<AtomicUsize>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry with Unix-domain sockets probed first and TCP as the fallback.
    pub fn new() -> Self {
        Self::with_transports(vec![Transport::UnixDomain, Transport::Tcp])
    }

    /// Registry probing exactly `transports`, in order.
    pub fn with_transports(transports: Vec<Transport>) -> Self {
        Self {
            transports,
            live: Arc::default(),
        }
    }

    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }

    /// Number of handles created through this registry that are still open.
    pub fn open_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Create an unconnected client handle for `addr`.
    pub fn client(&self, addr: &str) -> Result<Conn, TransportError> {
        for transport in &self.transports {
            let ctx = match transport {
                Transport::UnixDomain => UdsContext::client(addr)?.map(Context::Uds),
                Transport::Tcp => TcpContext::client(addr)?.map(Context::Tcp),
            };
            if let Some(ctx) = ctx {
                debug!(%addr, %transport, "Client handle created");
                return Ok(self.handle(Side::Client, ctx));
            }
        }
        Err(TransportError::AddressNotRecognized(addr.to_string()))
    }

    /// Bind and listen on `addr`.
    pub async fn server(&self, addr: &str) -> Result<Conn, TransportError> {
        for transport in &self.transports {
            let ctx = match transport {
                Transport::UnixDomain => UdsContext::server(addr)?.map(Context::Uds),
                Transport::Tcp => TcpContext::server(addr).await?.map(Context::Tcp),
            };
            if let Some(ctx) = ctx {
                debug!(%addr, %transport, "Listening");
                return Ok(self.handle(Side::ServerListen, ctx));
            }
        }
        Err(TransportError::AddressNotRecognized(addr.to_string()))
    }

    /// Wrap an existing descriptor as a handle of `transport`.
    pub fn wrap(
        &self,
        transport: Transport,
        fd: OwnedFd,
        side: Side,
    ) -> Result<Conn, TransportError> {
        Conn::adopt(LiveGuard::new(&self.live), transport, fd, side)
    }

    fn handle(&self, side: Side, ctx: Context) -> Conn {
        Conn {
            side,
            ctx,
            io_timeout: None,
            live: LiveGuard::new(&self.live),
        }
    }
}

/// An open connection handle.
///
/// Dropping a handle closes its descriptor; a Unix-domain listener also
/// removes its socket file.
pub struct Conn {
    side: Side,
    ctx: Context,
    io_timeout: Option<Duration>,
    live: LiveGuard,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("transport", &self.transport())
            .field("side", &self.side)
            .field("local", &self.local_address())
            .finish()
    }
}

impl Conn {
    fn adopt(
        live: LiveGuard,
        transport: Transport,
        fd: OwnedFd,
        side: Side,
    ) -> Result<Self, TransportError> {
        let ctx = match transport {
            Transport::Tcp => Context::Tcp(TcpContext::wrap(fd, side)?),
            Transport::UnixDomain => Context::Uds(UdsContext::wrap(fd, side)?),
        };
        Ok(Self {
            side,
            ctx,
            io_timeout: None,
            live,
        })
    }

    pub fn transport(&self) -> Transport {
        match self.ctx {
            Context::Tcp(_) => Transport::Tcp,
            Context::Uds(_) => Transport::UnixDomain,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    fn require(&self, side: Side, op: &'static str) -> Result<(), TransportError> {
        if self.side == side {
            Ok(())
        } else {
            Err(TransportError::WrongSide {
                op,
                side: self.side,
            })
        }
    }

    /// Connect a client handle.
    ///
    /// With [`Timeout::Poll`] an unfinished connect returns
    /// [`TransportError::InProgress`] and stays pending for
    /// [`connect_wait`](Self::connect_wait). With [`Timeout::Secs`] an
    /// expired connect is abandoned and reported as
    /// [`TransportError::Timeout`].
    pub async fn connect(&mut self, timeout: Timeout) -> Result<(), TransportError> {
        self.require(Side::Client, "connect")?;
        match &mut self.ctx {
            Context::Tcp(ctx) => ctx.connect(timeout).await,
            Context::Uds(ctx) => ctx.connect(timeout).await,
        }
    }

    /// Finish a connect started with [`Timeout::Poll`].
    pub async fn connect_wait(&mut self, timeout: Timeout) -> Result<(), TransportError> {
        self.require(Side::Client, "connect_wait")?;
        match &mut self.ctx {
            Context::Tcp(ctx) => ctx.link.connect_wait(timeout).await,
            Context::Uds(ctx) => ctx.link.connect_wait(timeout).await,
        }
    }

    /// Accept one connection from a listening handle.
    pub async fn accept(&self) -> Result<Conn, TransportError> {
        self.require(Side::ServerListen, "accept")?;
        let ctx = match &self.ctx {
            Context::Tcp(ctx) => Context::Tcp(ctx.accept().await?),
            Context::Uds(ctx) => Context::Uds(ctx.accept().await?),
        };
        let conn = Conn {
            side: Side::ServerWork,
            ctx,
            io_timeout: None,
            live: self.live.share(),
        };
        debug!(peer = %conn.remote_address(), "Accepted connection");
        Ok(conn)
    }

    /// Limit every later send and receive to `timeout`; `None` blocks.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.io_timeout = timeout;
    }

    fn stream(&mut self) -> Result<&mut dyn Stream, TransportError> {
        let stream: &mut dyn Stream = match &mut self.ctx {
            Context::Tcp(ctx) => ctx.link.stream()?,
            Context::Uds(ctx) => ctx.link.stream()?,
        };
        Ok(stream)
    }

    /// Send all of `data`.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let limit = self.io_timeout;
        let stream = self.stream()?;
        limited(limit, async {
            stream
                .write_all(data)
                .await
                .map_err(|err| stream_error("send", err))
        })
        .await
    }

    /// Fill `buf` completely. A peer that closes first yields
    /// [`TransportError::NotConnected`].
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let limit = self.io_timeout;
        let stream = self.stream()?;
        limited(limit, async {
            stream
                .read_exact(buf)
                .await
                .map(|_| ())
                .map_err(|err| stream_error("recv", err))
        })
        .await
    }

    /// Wait until the connection has data or has been closed by the peer.
    pub async fn readable(&self) -> Result<(), TransportError> {
        let ready = match &self.ctx {
            Context::Tcp(ctx) => match ctx.link.stream_ref() {
                Some(stream) => stream.readable().await,
                None => return Err(TransportError::NotConnected),
            },
            Context::Uds(ctx) => match ctx.link.stream_ref() {
                Some(stream) => stream.readable().await,
                None => return Err(TransportError::NotConnected),
            },
        };
        ready.map_err(|err| TransportError::io("poll", err))
    }

    /// Send `payload` with `fd` attached. The local copy of `fd` is closed
    /// once it has been sent.
    pub async fn descriptor_send(
        &mut self,
        payload: &[u8],
        fd: OwnedFd,
    ) -> Result<(), TransportError> {
        let limit = self.io_timeout;
        match &mut self.ctx {
            Context::Uds(ctx) => limited(limit, ctx.descriptor_send(payload, fd)).await,
            Context::Tcp(_) => Err(TransportError::Unsupported {
                op: "descriptor_send",
                transport: Transport::Tcp,
            }),
        }
    }

    /// Receive exactly `payload.len()` bytes and the descriptor sent with them.
    pub async fn descriptor_recv(&mut self, payload: &mut [u8]) -> Result<OwnedFd, TransportError> {
        let limit = self.io_timeout;
        match &mut self.ctx {
            Context::Uds(ctx) => limited(limit, ctx.descriptor_recv(payload)).await,
            Context::Tcp(_) => Err(TransportError::Unsupported {
                op: "descriptor_recv",
                transport: Transport::Tcp,
            }),
        }
    }

    /// Hand `conn` over to the peer. `conn` is consumed; its descriptor is
    /// closed locally after the send.
    pub async fn send_conn(&mut self, conn: Conn) -> Result<(), TransportError> {
        let name = encode_name(conn.transport());
        let fd = conn.into_fd()?;
        self.descriptor_send(&name, fd).await
    }

    /// Send a duplicate of `conn`'s descriptor, leaving `conn` open here.
    ///
    /// The duplicate shares its open file description with `conn`, so its
    /// blocking mode is left untouched.
    pub async fn send_duplicate(&mut self, conn: &Conn) -> Result<(), TransportError> {
        let name = encode_name(conn.transport());
        let fd = conn
            .descriptor()
            .ok_or(TransportError::NotConnected)?
            .try_clone_to_owned()
            .map_err(|err| TransportError::io("dup", err))?;
        self.descriptor_send(&name, fd).await
    }

    /// Receive a connection sent with [`send_conn`](Self::send_conn) or
    /// [`send_duplicate`](Self::send_duplicate).
    pub async fn recv_conn(&mut self, side: Side) -> Result<Conn, TransportError> {
        let mut name = [0u8; NAME_LEN];
        let fd = self.descriptor_recv(&mut name).await?;
        let transport = decode_name(&name)?;
        Conn::adopt(self.live.share(), transport, fd, side)
    }

    /// Whether the peer of this accepted connection is `addr`.
    pub async fn address_match(&self, addr: &str) -> bool {
        match &self.ctx {
            Context::Tcp(ctx) => ctx.address_match(addr).await,
            Context::Uds(ctx) => ctx.address_match(addr),
        }
    }

    pub fn local_address(&self) -> String {
        match &self.ctx {
            Context::Tcp(ctx) => ctx.local_address(),
            Context::Uds(ctx) => ctx.local_address(),
        }
    }

    pub fn remote_address(&self) -> String {
        match &self.ctx {
            Context::Tcp(ctx) => ctx.remote_address(),
            Context::Uds(ctx) => ctx.remote_address(),
        }
    }

    /// The underlying descriptor, once the handle has one.
    ///
    /// The descriptor is in non-blocking mode while the handle owns it; use
    /// [`into_fd`](Self::into_fd) to hand it to blocking code.
    pub(crate) fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        match &self.ctx {
            Context::Tcp(ctx) => ctx.descriptor(),
            Context::Uds(ctx) => ctx.descriptor(),
        }
    }

    /// Take the descriptor out of the handle, switched to blocking mode.
    pub fn into_fd(self) -> Result<OwnedFd, TransportError> {
        let Conn { ctx, .. } = self;
        match ctx {
            Context::Tcp(ctx) => ctx.into_fd(),
            Context::Uds(ctx) => ctx.into_fd(),
        }
    }

    /// Close the handle.
    pub fn close(self) {
        debug!(
            transport = %self.transport(),
            side = ?self.side,
            local = %self.local_address(),
            "Closing connection"
        );
    }
}

fn encode_name(transport: Transport) -> [u8; NAME_LEN] {
    let mut buf = [0u8; NAME_LEN];
    let name = transport.name().as_bytes();
    buf[..name.len()].copy_from_slice(name);
    buf
}

fn decode_name(buf: &[u8]) -> Result<Transport, TransportError> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]);
    Transport::from_name(&name).ok_or_else(|| TransportError::AddressNotRecognized(name.into_owned()))
}
