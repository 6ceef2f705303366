//! The native transport binding seam.
//!
//! A [`NativeBinding`] exposes the entry points of the native RDMA connection
//! library in the shape the library itself has: integer status codes, error
//! details read back from the context, and an explicit `close` that releases
//! the context. Translating that shape into [`NetError`](rdstream_net::NetError)
//! and enforcing the single-release discipline is done by the callers in this
//! crate, not by the binding.

use std::ffi::{c_int, c_long, CStr};
use std::net::SocketAddr;
use std::time::Duration;

/// Status returned by a successful `connect`.
pub const STATUS_OK: c_int = 0;

/// Transfer result: nothing was moved before the timeout expired.
pub const TRANSFER_AGAIN: isize = 0;

/// Transfer result: the peer has finished the stream.
pub const TRANSFER_EOF: isize = -2;

/// Entry points of a native RDMA connection library.
///
/// `send`/`recv` return the number of bytes moved (`> 0`), [`TRANSFER_AGAIN`],
/// [`TRANSFER_EOF`], or any other negative value on error, in which case the
/// error message and code are readable from the context.
///
/// The library is expected to tolerate one concurrent `send` and one
/// concurrent `recv` on the same context, hence `Context: Sync`.
pub trait NativeBinding: Send + Sync + 'static {
    /// One connection's native state.
    type Context: Send + Sync + 'static;

    /// Allocate a fresh context, or `None` if the library is out of memory.
    fn allocate(&self) -> Option<Self::Context>;

    /// Connect the context to `host:port`, blocking for at most
    /// `timeout_ms`. Returns [`STATUS_OK`] on success.
    fn connect(&self, ctx: &Self::Context, host: &CStr, port: c_int, timeout_ms: c_long) -> c_int;

    /// Diagnostic message of the last failed call on `ctx`.
    fn error_message(&self, ctx: &Self::Context) -> String;

    /// Numeric code of the last failed call on `ctx`.
    fn error_code(&self, ctx: &Self::Context) -> c_int;

    /// Local endpoint of a connected context, if the library can report it.
    fn local_addr(&self, ctx: &Self::Context) -> Option<SocketAddr>;

    /// Receive into `buf`, blocking for at most `timeout_ms`.
    fn recv(&self, ctx: &Self::Context, buf: &mut [u8], timeout_ms: c_long) -> isize;

    /// Send from `buf`, blocking for at most `timeout_ms`.
    fn send(&self, ctx: &Self::Context, buf: &[u8], timeout_ms: c_long) -> isize;

    /// Release every native resource held by `ctx`.
    fn close(&self, ctx: Self::Context);
}

/// Convert a duration to the millisecond argument of the native calls.
///
/// Saturates at `c_long::MAX` and never returns less than 1, since the
/// library may treat 0 as "wait forever".
pub fn to_native_millis(d: Duration) -> c_long {
    c_long::try_from(d.as_millis().max(1)).unwrap_or(c_long::MAX)
}
