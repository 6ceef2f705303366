//! TCP transport implementation for the rdstream networking layer.
//!
//! Provides [`TcpConn`] and [`TcpDialer`], which wrap Tokio's TCP primitives
//! and implement the [`rdstream_net::Conn`] and [`rdstream_net::Dialer`]
//! traits. This is the transport the RDMA dialer substitutes for.
//!
//! The connection splits a `TcpStream` into independent read/write halves so
//! that reading and writing can proceed concurrently without holding a single
//! lock over the entire stream.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdstream_net::{Conn, DialContext, Dialer, NetError};
use rdstream_types::{Address, AddressType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// Default connect timeout when the dial context carries no deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// TcpConn
// ---------------------------------------------------------------------------

/// A TCP connection wrapping a Tokio [`TcpStream`].
///
/// Deadlines are applied when an operation starts. Closing wakes any
/// operation blocked on the socket, which then fails with
/// `NetError::ConnectionClosed`.
pub struct TcpConn {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer_addr: Address,
    local_addr: Address,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    read_deadline: parking_lot::Mutex<Option<Instant>>,
    write_deadline: parking_lot::Mutex<Option<Instant>>,
}

impl TcpConn {
    /// Wrap an already-connected [`TcpStream`].
    pub fn from_stream(stream: TcpStream) -> Result<Self, NetError> {
        let peer_addr = Address::from_socket_addr(stream.peer_addr()?, AddressType::TCP);
        let local_addr = Address::from_socket_addr(stream.local_addr()?, AddressType::TCP);
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            peer_addr,
            local_addr,
            closed: AtomicBool::new(false),
            closed_tx,
            read_deadline: parking_lot::Mutex::new(None),
            write_deadline: parking_lot::Mutex::new(None),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drive `io` until it completes, `deadline` passes, or the connection
    /// is closed.
    async fn guarded<T, F>(&self, deadline: Option<Instant>, io: F) -> Result<T, NetError>
    where
        F: Future<Output = std::io::Result<T>> + Send,
    {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(NetError::ConnectionClosed);
        }
        let sleep_until = deadline.map(tokio::time::Instant::from_std);

        tokio::select! {
            result = io => Ok(result?),
            _ = closed_rx.changed() => Err(NetError::ConnectionClosed),
            _ = async {
                match sleep_until {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => Err(NetError::Timeout),
        }
    }
}

impl std::fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConn")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Conn for TcpConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        let deadline = *self.read_deadline.lock();
        if deadline.is_some_and(|at| at <= Instant::now()) {
            return Err(NetError::Timeout);
        }

        let mut reader = self.reader.lock().await;
        self.guarded(deadline, reader.read(buf)).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        let deadline = *self.write_deadline.lock();
        if deadline.is_some_and(|at| at <= Instant::now()) {
            return Err(NetError::Timeout);
        }

        let mut writer = self.writer.lock().await;
        self.guarded(deadline, writer.write(buf)).await
    }

    async fn close(&self) -> Result<(), NetError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.closed_tx.send_replace(true);

        // Blocked operations have been woken and release the lock; ignore
        // shutdown errors (e.g. peer already gone).
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;

        tracing::debug!(peer = %self.peer_addr, "Closed TCP connection");
        Ok(())
    }

    fn local_addr(&self) -> Address {
        self.local_addr.clone()
    }

    fn peer_addr(&self) -> Address {
        self.peer_addr.clone()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock() = deadline;
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock() = deadline;
    }
}

// ---------------------------------------------------------------------------
// Dialer implementation
// ---------------------------------------------------------------------------

/// A dialer that creates [`TcpConn`] instances by opening TCP connections.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Use `connect_timeout` when the dial context has no deadline.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpConn;

    async fn dial(&self, ctx: &DialContext, destination: &str) -> Result<TcpConn, NetError> {
        let peer = Address::parse_host_port(destination, AddressType::TCP)?;

        let now = Instant::now();
        if ctx.is_expired(now) {
            return Err(NetError::Timeout);
        }
        let timeout = ctx.remaining(now).unwrap_or(self.connect_timeout);

        tracing::debug!(peer = %peer, "Dialing TCP connection");
        let stream = tokio::time::timeout(timeout, TcpStream::connect((peer.host.as_str(), peer.port)))
            .await
            .map_err(|_| NetError::Timeout)??;
        TcpConn::from_stream(stream)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
