//! RDMA transport for rdstream networking.
//!
//! This crate provides an RDMA-backed stream connection implementing the
//! `Conn` and `Dialer` traits from `rdstream-net`, so it can stand in for
//! the TCP transport wherever a client takes a dialer.
//!
//! The verbs-level data path lives in a native connection library. The
//! `rdma` feature links `librdmaconn` through [`FfiBinding`]; without it,
//! [`LoopbackBinding`] provides an in-process echoing transport so the rest
//! of the stack can be built and tested without RDMA hardware.
//!
//! # Architecture
//!
//! - `NativeBinding`: the native library's entry points (connect, error
//!   readout, send/recv, close) over an opaque per-connection context.
//! - `RdmaDialer`: parses the destination, derives the connect timeout from
//!   the caller's deadline, allocates and connects a context, and releases it
//!   again if connecting fails.
//! - `RdmaConnection`: the live connection. Owns its context through a
//!   single-owner handle that releases it exactly once, on the first close or
//!   when the last reference is dropped.
//! - `RdmaConfig`: connect timeout, poll interval and transfer size.

pub mod binding;
pub mod config;
pub mod connection;
pub mod dial;
#[cfg(feature = "rdma")]
pub mod ffi;
mod handle;
pub mod loopback;

pub use binding::NativeBinding;
pub use config::{ConfigError, RdmaConfig};
pub use connection::{ConnectionState, RdmaConnection};
pub use dial::{native_timeout, RdmaDialer, DEFAULT_CONNECT_TIMEOUT};
#[cfg(feature = "rdma")]
pub use ffi::FfiBinding;
pub use loopback::LoopbackBinding;

/// Dial `destination` over the native RDMA library with the default
/// configuration.
#[cfg(feature = "rdma")]
pub async fn dial(
    ctx: &rdstream_net::DialContext,
    destination: &str,
) -> Result<RdmaConnection<FfiBinding>, rdstream_net::NetError> {
    use rdstream_net::Dialer;

    RdmaDialer::with_default_config(FfiBinding)
        .dial(ctx, destination)
        .await
}
