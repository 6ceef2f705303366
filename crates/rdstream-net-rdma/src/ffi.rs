//! Binding to the native `librdmaconn` connection library.
//!
//! Only compiled with the `rdma` feature. The library owns all verbs-level
//! state (queue pair, completion queue, registered buffers) behind an opaque
//! `RdmaContext`; this module exposes its entry points as a [`NativeBinding`].

use std::ffi::{c_char, c_int, c_long, c_void, CStr};
use std::marker::{PhantomData, PhantomPinned};
use std::net::{IpAddr, SocketAddr};
use std::ptr::NonNull;

use crate::binding::NativeBinding;

/// Opaque native connection context.
#[repr(C)]
pub struct RdmaContext {
    _data: [u8; 0],
    _marker: PhantomData<(*mut u8, PhantomPinned)>,
}

#[link(name = "rdmaconn")]
extern "C" {
    fn rdma_context_alloc() -> *mut RdmaContext;
    fn rdma_connect(
        ctx: *mut RdmaContext,
        addr: *const c_char,
        port: c_int,
        timeout_msec: c_long,
    ) -> c_int;
    fn rdma_context_errstr(ctx: *const RdmaContext) -> *const c_char;
    fn rdma_context_errno(ctx: *const RdmaContext) -> c_int;
    fn rdma_local_addr(
        ctx: *const RdmaContext,
        buf: *mut c_char,
        buflen: usize,
        port: *mut c_int,
    ) -> c_int;
    fn rdma_recv(ctx: *mut RdmaContext, buf: *mut c_void, len: usize, timeout_msec: c_long) -> isize;
    fn rdma_send(
        ctx: *mut RdmaContext,
        buf: *const c_void,
        len: usize,
        timeout_msec: c_long,
    ) -> isize;
    fn rdma_close(ctx: *mut RdmaContext);
}

/// Owning pointer to a live `RdmaContext`. Neither `Clone` nor `Copy`: the
/// pointer is released by moving this value into [`FfiBinding::close`].
pub struct FfiContext(NonNull<RdmaContext>);

// SAFETY: the library allows a context to be used from any thread, with one
// concurrent sender and one concurrent receiver. Release is serialized by
// `NativeHandle`, which holds the exclusive guard while calling `close`.
unsafe impl Send for FfiContext {}
unsafe impl Sync for FfiContext {}

impl FfiContext {
    fn as_ptr(&self) -> *mut RdmaContext {
        self.0.as_ptr()
    }
}

/// [`NativeBinding`] over `librdmaconn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfiBinding;

impl NativeBinding for FfiBinding {
    type Context = FfiContext;

    fn allocate(&self) -> Option<FfiContext> {
        // SAFETY: no preconditions; a null return signals allocation failure.
        let raw = unsafe { rdma_context_alloc() };
        NonNull::new(raw).map(FfiContext)
    }

    fn connect(&self, ctx: &FfiContext, host: &CStr, port: c_int, timeout_ms: c_long) -> c_int {
        // SAFETY: `ctx` is live for the duration of the borrow and `host` is
        // NUL-terminated; the library does not retain the string.
        unsafe { rdma_connect(ctx.as_ptr(), host.as_ptr(), port, timeout_ms) }
    }

    fn error_message(&self, ctx: &FfiContext) -> String {
        // SAFETY: the library returns null or a NUL-terminated string owned by
        // the context, valid until the next call on it; we copy it out.
        unsafe {
            let s = rdma_context_errstr(ctx.as_ptr());
            if s.is_null() {
                String::new()
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        }
    }

    fn error_code(&self, ctx: &FfiContext) -> c_int {
        // SAFETY: `ctx` is live for the duration of the borrow.
        unsafe { rdma_context_errno(ctx.as_ptr()) }
    }

    fn local_addr(&self, ctx: &FfiContext) -> Option<SocketAddr> {
        let mut buf: [c_char; 64] = [0; 64];
        let mut port: c_int = 0;
        // SAFETY: `buf` is writable for `buf.len()` bytes and the library
        // NUL-terminates within that length on success.
        let ip = unsafe {
            if rdma_local_addr(ctx.as_ptr(), buf.as_mut_ptr(), buf.len(), &mut port) != 0 {
                return None;
            }
            CStr::from_ptr(buf.as_ptr()).to_str().ok()?.parse::<IpAddr>().ok()?
        };
        let port = u16::try_from(port).ok()?;
        Some(SocketAddr::new(ip, port))
    }

    fn recv(&self, ctx: &FfiContext, buf: &mut [u8], timeout_ms: c_long) -> isize {
        // SAFETY: `buf` is writable for `buf.len()` bytes.
        unsafe { rdma_recv(ctx.as_ptr(), buf.as_mut_ptr().cast(), buf.len(), timeout_ms) }
    }

    fn send(&self, ctx: &FfiContext, buf: &[u8], timeout_ms: c_long) -> isize {
        // SAFETY: `buf` is readable for `buf.len()` bytes; the library copies
        // into its registered send buffers before returning.
        unsafe { rdma_send(ctx.as_ptr(), buf.as_ptr().cast(), buf.len(), timeout_ms) }
    }

    fn close(&self, ctx: FfiContext) {
        // SAFETY: `ctx` is consumed, so this is the last use of the pointer.
        unsafe { rdma_close(ctx.as_ptr()) }
    }
}
