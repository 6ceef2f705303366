//! In-process native binding.
//!
//! [`LoopbackBinding`] stands in for the native library where no RDMA
//! hardware is present. Every connection echoes: bytes sent on a context
//! become readable from the same context. The binding counts allocations
//! and releases, and panics if a context is touched after it was closed,
//! so lifecycle mistakes surface immediately.

use std::collections::HashSet;
use std::ffi::{c_int, c_long, CStr};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::{Condvar, Mutex};

use crate::binding::{NativeBinding, STATUS_OK, TRANSFER_AGAIN, TRANSFER_EOF};

/// Status returned by scripted failures.
const STATUS_FAILED: c_int = -1;

/// A recorded `connect` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub host: String,
    pub port: c_int,
    pub timeout_ms: c_long,
}

/// Native state of one loopback connection.
pub struct LoopbackContext {
    id: u64,
    inbox: Mutex<BytesMut>,
    readable: Condvar,
    last_error: Mutex<(String, c_int)>,
}

impl LoopbackContext {
    fn set_error(&self, message: &str, code: c_int) {
        *self.last_error.lock() = (message.to_string(), code);
    }
}

/// An echoing, instrumented stand-in for the native RDMA library.
pub struct LoopbackBinding {
    next_id: AtomicU64,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    live: Mutex<HashSet<u64>>,
    local_addr: SocketAddr,
    fail_allocation: AtomicBool,
    connect_failure: Mutex<Option<(String, c_int)>>,
    transfer_failure: Mutex<Option<(String, c_int)>>,
    hung_up: AtomicBool,
    overreport: AtomicBool,
    connect_calls: Mutex<Vec<ConnectCall>>,
}

impl LoopbackBinding {
    pub fn new() -> Self {
        Self::with_local_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 40000)))
    }

    /// A binding whose connections report `local_addr` as their local endpoint.
    pub fn with_local_addr(local_addr: SocketAddr) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
            local_addr,
            fail_allocation: AtomicBool::new(false),
            connect_failure: Mutex::new(None),
            transfer_failure: Mutex::new(None),
            hung_up: AtomicBool::new(false),
            overreport: AtomicBool::new(false),
            connect_calls: Mutex::new(Vec::new()),
        }
    }

    /// Make every later `allocate` fail.
    pub fn fail_allocation(&self) {
        self.fail_allocation.store(true, Ordering::Release);
    }

    /// Make every later `connect` fail with `message` and `code`.
    pub fn fail_connect_with(&self, message: impl Into<String>, code: c_int) {
        *self.connect_failure.lock() = Some((message.into(), code));
    }

    /// Make every later `send`/`recv` fail with `message` and `code`.
    pub fn fail_transfers_with(&self, message: impl Into<String>, code: c_int) {
        *self.transfer_failure.lock() = Some((message.into(), code));
    }

    /// Simulate the peer finishing the stream: buffered bytes can still be
    /// read, after which `recv` reports EOF and `send` is refused.
    pub fn hang_up(&self) {
        self.hung_up.store(true, Ordering::Release);
    }

    /// Make every later `send`/`recv` claim one byte more than the buffer
    /// holds, without moving any data.
    pub fn overreport_transfers(&self) {
        self.overreport.store(true, Ordering::Release);
    }

    /// Number of contexts allocated so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    /// Number of contexts released so far.
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Acquire)
    }

    /// Contexts allocated but not yet released.
    pub fn outstanding(&self) -> usize {
        self.live.lock().len()
    }

    /// Every `connect` call seen so far, in order.
    pub fn connect_calls(&self) -> Vec<ConnectCall> {
        self.connect_calls.lock().clone()
    }

    fn check_live(&self, ctx: &LoopbackContext) {
        assert!(
            self.live.lock().contains(&ctx.id),
            "loopback context {} used after close",
            ctx.id
        );
    }

    fn scripted_transfer_failure(&self, ctx: &LoopbackContext) -> bool {
        match self.transfer_failure.lock().as_ref() {
            Some((message, code)) => {
                ctx.set_error(message, *code);
                true
            }
            None => false,
        }
    }
}

impl Default for LoopbackBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBinding for LoopbackBinding {
    type Context = LoopbackContext;

    fn allocate(&self) -> Option<LoopbackContext> {
        if self.fail_allocation.load(Ordering::Acquire) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(id);
        self.allocations.fetch_add(1, Ordering::AcqRel);
        Some(LoopbackContext {
            id,
            inbox: Mutex::new(BytesMut::new()),
            readable: Condvar::new(),
            last_error: Mutex::new((String::new(), 0)),
        })
    }

    fn connect(&self, ctx: &LoopbackContext, host: &CStr, port: c_int, timeout_ms: c_long) -> c_int {
        self.check_live(ctx);
        self.connect_calls.lock().push(ConnectCall {
            host: host.to_string_lossy().into_owned(),
            port,
            timeout_ms,
        });
        match self.connect_failure.lock().as_ref() {
            Some((message, code)) => {
                ctx.set_error(message, *code);
                STATUS_FAILED
            }
            None => STATUS_OK,
        }
    }

    fn error_message(&self, ctx: &LoopbackContext) -> String {
        self.check_live(ctx);
        ctx.last_error.lock().0.clone()
    }

    fn error_code(&self, ctx: &LoopbackContext) -> c_int {
        self.check_live(ctx);
        ctx.last_error.lock().1
    }

    fn local_addr(&self, ctx: &LoopbackContext) -> Option<SocketAddr> {
        self.check_live(ctx);
        Some(self.local_addr)
    }

    fn recv(&self, ctx: &LoopbackContext, buf: &mut [u8], timeout_ms: c_long) -> isize {
        self.check_live(ctx);
        if self.scripted_transfer_failure(ctx) {
            return -1;
        }
        if self.overreport.load(Ordering::Acquire) {
            return buf.len() as isize + 1;
        }

        let mut inbox = ctx.inbox.lock();
        if inbox.is_empty() && !self.hung_up.load(Ordering::Acquire) {
            let wait = Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0));
            ctx.readable.wait_for(&mut inbox, wait);
        }
        if inbox.is_empty() {
            return if self.hung_up.load(Ordering::Acquire) {
                TRANSFER_EOF
            } else {
                TRANSFER_AGAIN
            };
        }

        let n = buf.len().min(inbox.len());
        buf[..n].copy_from_slice(&inbox[..n]);
        inbox.advance(n);
        n as isize
    }

    fn send(&self, ctx: &LoopbackContext, buf: &[u8], _timeout_ms: c_long) -> isize {
        self.check_live(ctx);
        if self.scripted_transfer_failure(ctx) {
            return -1;
        }
        if self.overreport.load(Ordering::Acquire) {
            return buf.len() as isize + 1;
        }
        if self.hung_up.load(Ordering::Acquire) {
            return TRANSFER_EOF;
        }

        ctx.inbox.lock().extend_from_slice(buf);
        ctx.readable.notify_all();
        buf.len() as isize
    }

    fn close(&self, ctx: LoopbackContext) {
        assert!(
            self.live.lock().remove(&ctx.id),
            "loopback context {} closed twice",
            ctx.id
        );
        self.frees.fetch_add(1, Ordering::AcqRel);
    }
}
