//! RDMA connection implementing the rdstream-net `Conn` trait.

use std::ffi::c_long;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use rdstream_net::{Conn, NetError};
use rdstream_types::Address;

use crate::binding::{to_native_millis, NativeBinding, TRANSFER_AGAIN, TRANSFER_EOF};
use crate::config::RdmaConfig;
use crate::handle::NativeHandle;

/// State of an RDMA connection as seen by callers.
///
/// A connection under construction never escapes the dialer, so only the
/// two terminal-ordered states are observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected and usable.
    Open,
    /// Closed; the native context has been released.
    Closed,
}

/// An RDMA-backed stream connection.
///
/// Owns one native context for its whole lifetime. Reads and writes run on
/// the blocking thread pool and wait inside the native library in slices of
/// at most `poll_interval`, re-checking the closed flag and the current
/// deadline between slices. Closing (or dropping the last reference)
/// releases the native context exactly once.
pub struct RdmaConnection<B: NativeBinding> {
    inner: Arc<Inner<B>>,
}

struct Inner<B: NativeBinding> {
    handle: NativeHandle<B>,
    local_addr: Address,
    peer_addr: Address,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    /// Bytes received from the native side but not yet handed to a reader.
    pending: Mutex<BytesMut>,
    poll_interval: Duration,
    max_transfer_size: usize,
}

/// How a blocking receive ended.
enum Received {
    /// Bytes were appended to `pending`.
    Buffered,
    /// The peer finished sending.
    Eof,
}

/// Flags an in-flight blocking transfer as abandoned when the future that
/// started it is dropped, so the loop stops at its next slice.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl<B: NativeBinding> RdmaConnection<B> {
    pub(crate) fn new(
        handle: NativeHandle<B>,
        local_addr: Address,
        peer_addr: Address,
        config: &RdmaConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                handle,
                local_addr,
                peer_addr,
                read_deadline: Mutex::new(None),
                write_deadline: Mutex::new(None),
                pending: Mutex::new(BytesMut::new()),
                poll_interval: config.poll_interval,
                max_transfer_size: (config.max_transfer_size as usize).max(1),
            }),
        }
    }

    /// Return the current connection state.
    pub fn state(&self) -> ConnectionState {
        if self.inner.handle.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.handle.is_closed()
    }

    /// Return a description of this connection.
    pub fn describe(&self) -> String {
        format!(
            "RdmaConnection({} -> {}, state={:?})",
            self.inner.local_addr,
            self.inner.peer_addr,
            self.state()
        )
    }
}

/// Byte count reported by a native transfer, checked against the buffer.
fn transferred(n: isize, len: usize) -> Result<usize, NetError> {
    match usize::try_from(n) {
        Ok(n) if n <= len => Ok(n),
        _ => Err(NetError::Transfer {
            message: format!("native transfer reported {n} bytes for a {len}-byte buffer"),
            code: 0,
        }),
    }
}

impl<B: NativeBinding> Inner<B> {
    /// Timeout for the next native wait, or the error that ends the operation.
    fn next_slice(
        &self,
        deadline: &Mutex<Option<Instant>>,
        abandoned: &AtomicBool,
    ) -> Result<c_long, NetError> {
        // Nobody waits for an abandoned transfer's result.
        if self.handle.is_closed() || abandoned.load(Ordering::Acquire) {
            return Err(NetError::ConnectionClosed);
        }
        let wait = match *deadline.lock() {
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(NetError::Timeout);
                }
                left.min(self.poll_interval)
            }
            None => self.poll_interval,
        };
        Ok(to_native_millis(wait))
    }

    /// Move up to `buf.len()` pending bytes into `buf`.
    fn take_pending(&self, buf: &mut [u8]) -> usize {
        let mut pending = self.pending.lock();
        let n = buf.len().min(pending.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.advance(n);
        n
    }

    /// Receive into `pending` so bytes survive the reader giving up.
    fn read_blocking(&self, len: usize, abandoned: &AtomicBool) -> Result<Received, NetError> {
        let mut scratch = vec![0u8; len];
        loop {
            let timeout_ms = self.next_slice(&self.read_deadline, abandoned)?;
            let n = self.handle.with_context(|binding, ctx| {
                let n = binding.recv(ctx, &mut scratch, timeout_ms);
                if n < 0 && n != TRANSFER_EOF {
                    return Err(NetError::Transfer {
                        message: binding.error_message(ctx),
                        code: binding.error_code(ctx),
                    });
                }
                Ok(n)
            })??;
            match n {
                TRANSFER_AGAIN => continue,
                TRANSFER_EOF => return Ok(Received::Eof),
                n => {
                    let n = transferred(n, scratch.len())?;
                    self.pending.lock().extend_from_slice(&scratch[..n]);
                    return Ok(Received::Buffered);
                }
            }
        }
    }

    fn write_blocking(&self, buf: &[u8], abandoned: &AtomicBool) -> Result<usize, NetError> {
        loop {
            let timeout_ms = self.next_slice(&self.write_deadline, abandoned)?;
            let n = self.handle.with_context(|binding, ctx| {
                let n = binding.send(ctx, buf, timeout_ms);
                if n < 0 && n != TRANSFER_EOF {
                    return Err(NetError::Transfer {
                        message: binding.error_message(ctx),
                        code: binding.error_code(ctx),
                    });
                }
                Ok(n)
            })??;
            match n {
                TRANSFER_AGAIN => continue,
                TRANSFER_EOF => {
                    return Err(NetError::Io(std::io::ErrorKind::BrokenPipe.into()));
                }
                n => return transferred(n, buf.len()),
            }
        }
    }
}

/// Run a blocking native operation on tokio's blocking pool.
pub(crate) async fn run_blocking<F, R>(f: F) -> Result<R, NetError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NetError::Io(std::io::Error::other(e)))
}

#[async_trait]
impl<B: NativeBinding> Conn for RdmaConnection<B> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let n = self.inner.take_pending(buf);
            if n > 0 {
                return Ok(n);
            }

            let inner = Arc::clone(&self.inner);
            let len = buf.len().min(self.inner.max_transfer_size);
            let abandoned = Arc::new(AtomicBool::new(false));
            let _guard = AbandonOnDrop(Arc::clone(&abandoned));
            let received = run_blocking(move || inner.read_blocking(len, &abandoned)).await??;
            if let Received::Eof = received {
                return Ok(0);
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let inner = Arc::clone(&self.inner);
        let chunk = buf[..buf.len().min(self.inner.max_transfer_size)].to_vec();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(Arc::clone(&abandoned));
        run_blocking(move || inner.write_blocking(&chunk, &abandoned)).await?
    }

    async fn close(&self) -> Result<(), NetError> {
        if self.is_closed() {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let released = run_blocking(move || inner.handle.close()).await?;
        if released {
            tracing::debug!(
                peer = %self.inner.peer_addr,
                "Closed RDMA connection"
            );
        }
        Ok(())
    }

    fn local_addr(&self) -> Address {
        self.inner.local_addr.clone()
    }

    fn peer_addr(&self) -> Address {
        self.inner.peer_addr.clone()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.inner.read_deadline.lock() = deadline;
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.inner.write_deadline.lock() = deadline;
    }
}

impl<B: NativeBinding> std::fmt::Debug for RdmaConnection<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaConnection")
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
