use std::time::Instant;

use async_trait::async_trait;
use rdstream_types::Address;

use crate::error::NetError;

/// A bidirectional byte stream with deadlines.
///
/// This is the capability set a client expects from a stream socket, so any
/// implementation (TCP, RDMA, in-memory) can be substituted behind a
/// [`Dialer`](crate::Dialer). One concurrent reader and one concurrent writer
/// are supported; `close` may be called from any task at any time.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Read into `buf`, waiting until at least one byte is available.
    ///
    /// Fails with `NetError::ConnectionClosed` once the connection is closed
    /// and with `NetError::Timeout` if the read deadline elapses first.
    /// `Ok(0)` means the peer finished the stream (or `buf` is empty).
    async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError>;

    /// Write from `buf`, returning how many bytes were accepted.
    async fn write(&self, buf: &[u8]) -> Result<usize, NetError>;

    /// Write the whole of `buf`.
    async fn write_all(&self, mut buf: &[u8]) -> Result<(), NetError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(NetError::ConnectionClosed);
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Close the connection. Idempotent: only the first call releases the
    /// underlying transport, later calls return `Ok(())`.
    async fn close(&self) -> Result<(), NetError>;

    /// Return the local address.
    fn local_addr(&self) -> Address;

    /// Return the remote peer address.
    fn peer_addr(&self) -> Address;

    /// Set both the read and the write deadline. `None` clears them.
    fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Set the deadline for current and future reads. `None` clears it.
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// Set the deadline for current and future writes. `None` clears it.
    fn set_write_deadline(&self, deadline: Option<Instant>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rdstream_types::AddressType;

    /// Accepts at most `chunk` bytes per write and records everything.
    struct ChunkedConn {
        chunk: usize,
        written: Mutex<Vec<u8>>,
        read_deadline: Mutex<Option<Instant>>,
        write_deadline: Mutex<Option<Instant>>,
    }

    impl ChunkedConn {
        fn new(chunk: usize) -> Self {
            Self {
                chunk,
                written: Mutex::new(Vec::new()),
                read_deadline: Mutex::new(None),
                write_deadline: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Conn for ChunkedConn {
        async fn read(&self, _buf: &mut [u8]) -> Result<usize, NetError> {
            Err(NetError::Timeout)
        }
        async fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
            let n = buf.len().min(self.chunk);
            self.written.lock().extend_from_slice(&buf[..n]);
            Ok(n)
        }
        async fn close(&self) -> Result<(), NetError> {
            Ok(())
        }
        fn local_addr(&self) -> Address {
            Address::new("127.0.0.1", 1, AddressType::TCP)
        }
        fn peer_addr(&self) -> Address {
            Address::new("127.0.0.1", 2, AddressType::TCP)
        }
        fn set_read_deadline(&self, deadline: Option<Instant>) {
            *self.read_deadline.lock() = deadline;
        }
        fn set_write_deadline(&self, deadline: Option<Instant>) {
            *self.write_deadline.lock() = deadline;
        }
    }

    #[tokio::test]
    async fn test_write_all_loops_over_short_writes() {
        let conn = ChunkedConn::new(3);
        conn.write_all(b"hello world").await.unwrap();
        assert_eq!(conn.written.lock().as_slice(), b"hello world");
    }

    #[tokio::test]
    async fn test_write_all_zero_write_is_closed() {
        let conn = ChunkedConn::new(0);
        let err = conn.write_all(b"x").await.unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn test_set_deadline_sets_both() {
        let conn = ChunkedConn::new(1);
        let at = Instant::now();
        conn.set_deadline(Some(at));
        assert_eq!(*conn.read_deadline.lock(), Some(at));
        assert_eq!(*conn.write_deadline.lock(), Some(at));

        conn.set_deadline(None);
        assert_eq!(*conn.read_deadline.lock(), None);
        assert_eq!(*conn.write_deadline.lock(), None);
    }
}
