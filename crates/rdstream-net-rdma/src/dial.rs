//! Establishing RDMA connections.

use std::ffi::{c_int, c_long, CStr, CString};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdstream_net::{DialContext, Dialer, NetError};
use rdstream_types::{Address, AddressParseError, AddressType};

use crate::binding::{to_native_millis, NativeBinding, STATUS_OK};
use crate::config::{ConfigError, RdmaConfig};
use crate::connection::{run_blocking, RdmaConnection};
use crate::handle::NativeHandle;

/// Connect timeout used when neither the dial context nor the configuration
/// says otherwise.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout to hand to the native connect call.
///
/// This is the time remaining until `deadline` as of `now`. When there is no
/// deadline, or it leaves no time, `default` is used.
pub fn native_timeout(deadline: Option<Instant>, now: Instant, default: Duration) -> Duration {
    deadline
        .and_then(|at| at.checked_duration_since(now))
        .filter(|left| !left.is_zero())
        .unwrap_or(default)
}

/// Dials RDMA connections through a [`NativeBinding`].
///
/// Implements [`Dialer`] so it can replace the TCP dialer wherever a client
/// is configured with one.
pub struct RdmaDialer<B: NativeBinding> {
    binding: Arc<B>,
    config: RdmaConfig,
}

impl<B: NativeBinding> RdmaDialer<B> {
    /// Create a dialer, rejecting a configuration that fails
    /// [`RdmaConfig::validate`].
    pub fn new(binding: B, config: RdmaConfig) -> Result<Self, ConfigError> {
        Self::with_shared_binding(Arc::new(binding), config)
    }

    /// Create a dialer over a binding shared with other dialers.
    pub fn with_shared_binding(binding: Arc<B>, config: RdmaConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { binding, config })
    }

    /// Create a dialer with [`RdmaConfig::default`].
    pub fn with_default_config(binding: B) -> Self {
        Self {
            binding: Arc::new(binding),
            config: RdmaConfig::default(),
        }
    }

    pub fn binding(&self) -> &Arc<B> {
        &self.binding
    }

    pub fn config(&self) -> &RdmaConfig {
        &self.config
    }
}

/// Allocate a context and connect it. On failure the context is released
/// before the translated error is returned.
fn connect_native<B: NativeBinding>(
    binding: Arc<B>,
    host: &CStr,
    port: c_int,
    timeout_ms: c_long,
) -> Result<(NativeHandle<B>, Option<SocketAddr>), NetError> {
    let ctx = binding.allocate().ok_or(NetError::AllocationFailed)?;
    let handle = NativeHandle::new(binding, ctx);

    let outcome = handle.with_context(|binding, ctx| {
        if binding.connect(ctx, host, port, timeout_ms) == STATUS_OK {
            Ok(binding.local_addr(ctx))
        } else {
            Err(NetError::Connect {
                message: binding.error_message(ctx),
                code: binding.error_code(ctx),
            })
        }
    })?;

    match outcome {
        Ok(local) => Ok((handle, local)),
        Err(err) => {
            handle.close();
            Err(err)
        }
    }
}

#[async_trait]
impl<B: NativeBinding> Dialer for RdmaDialer<B> {
    type Conn = RdmaConnection<B>;

    async fn dial(&self, ctx: &DialContext, destination: &str) -> Result<RdmaConnection<B>, NetError> {
        let peer = Address::parse_host_port(destination, AddressType::RDMA)?;
        let host = CString::new(peer.host.as_str())
            .map_err(|_| NetError::Parse(AddressParseError::InvalidHost))?;

        let now = Instant::now();
        if ctx.is_expired(now) {
            return Err(NetError::Timeout);
        }
        let timeout_ms = to_native_millis(native_timeout(
            ctx.deadline(),
            now,
            self.config.connect_timeout,
        ));

        tracing::debug!(peer = %peer, timeout_ms, "Dialing RDMA connection");

        let binding = Arc::clone(&self.binding);
        let port = c_int::from(peer.port);
        let connected =
            run_blocking(move || connect_native(binding, &host, port, timeout_ms)).await?;
        let (handle, local) = match connected {
            Ok(connected) => connected,
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "RDMA connect failed");
                return Err(err);
            }
        };

        let local_addr = local
            .map(|sa| Address::from_socket_addr(sa, AddressType::RDMA))
            .unwrap_or_else(|| Address::unspecified(AddressType::RDMA));
        tracing::debug!(peer = %peer, local = %local_addr, "RDMA connection established");

        Ok(RdmaConnection::new(handle, local_addr, peer, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBinding;
    use rdstream_net::Conn;

    fn dialer() -> RdmaDialer<LoopbackBinding> {
        RdmaDialer::with_default_config(LoopbackBinding::new())
    }

    #[test]
    fn test_dialer_rejects_invalid_config() {
        let zero_transfer = RdmaConfig {
            max_transfer_size: 0,
            ..RdmaConfig::default()
        };
        assert!(matches!(
            RdmaDialer::new(LoopbackBinding::new(), zero_transfer),
            Err(ConfigError::Invalid(_))
        ));

        let zero_poll = RdmaConfig {
            poll_interval: Duration::ZERO,
            ..RdmaConfig::default()
        };
        let binding = Arc::new(LoopbackBinding::new());
        assert!(RdmaDialer::with_shared_binding(binding, zero_poll).is_err());

        let dialer = RdmaDialer::new(LoopbackBinding::new(), RdmaConfig::default()).unwrap();
        assert_eq!(dialer.config(), &RdmaConfig::default());
    }

    #[test]
    fn test_native_timeout_is_remaining_time() {
        let now = Instant::now();
        let timeout = native_timeout(
            Some(now + Duration::from_secs(5)),
            now,
            DEFAULT_CONNECT_TIMEOUT,
        );
        assert_eq!(timeout, Duration::from_secs(5));
        assert_eq!(to_native_millis(timeout), 5000);
    }

    #[test]
    fn test_native_timeout_defaults() {
        let now = Instant::now();
        assert_eq!(
            native_timeout(None, now, DEFAULT_CONNECT_TIMEOUT),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            native_timeout(Some(now), now, DEFAULT_CONNECT_TIMEOUT),
            DEFAULT_CONNECT_TIMEOUT
        );
        assert_eq!(
            native_timeout(Some(now), now + Duration::from_secs(1), DEFAULT_CONNECT_TIMEOUT),
            DEFAULT_CONNECT_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_dial_success() {
        let dialer = dialer();
        let conn = dialer
            .dial(&DialContext::background(), "10.0.0.1:6378")
            .await
            .unwrap();

        assert_eq!(conn.peer_addr(), Address::new("10.0.0.1", 6378, AddressType::RDMA));
        assert_eq!(conn.local_addr(), Address::new("127.0.0.1", 40000, AddressType::RDMA));
        assert!(!conn.is_closed());

        let binding = dialer.binding();
        assert_eq!(binding.allocations(), 1);
        assert_eq!(binding.frees(), 0);
        let calls = binding.connect_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].host, "10.0.0.1");
        assert_eq!(calls[0].port, 6378);
        assert_eq!(calls[0].timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn test_dial_passes_remaining_deadline() {
        let dialer = dialer();
        let ctx = DialContext::with_timeout(Duration::from_secs(5));
        let _conn = dialer.dial(&ctx, "cache.local:6379").await.unwrap();

        let timeout_ms = dialer.binding().connect_calls()[0].timeout_ms;
        assert!(
            (4_500..=5_000).contains(&timeout_ms),
            "timeout_ms = {timeout_ms}"
        );
    }

    #[tokio::test]
    async fn test_dial_malformed_destination_allocates_nothing() {
        let dialer = dialer();
        for destination in ["10.0.0.1", "10.0.0.1:", "10.0.0.1:redis", "10.0.0.1:70000", ":6379", ""] {
            let err = dialer
                .dial(&DialContext::background(), destination)
                .await
                .unwrap_err();
            assert!(matches!(err, NetError::Parse(_)), "{destination}: {err}");
        }
        assert_eq!(dialer.binding().allocations(), 0);
    }

    #[tokio::test]
    async fn test_dial_connect_failure_releases_context() {
        let dialer = dialer();
        dialer.binding().fail_connect_with("timed out", 110);

        let ctx = DialContext::with_timeout(Duration::from_secs(2));
        let err = dialer.dial(&ctx, "10.0.0.1:6378").await.unwrap_err();
        match err {
            NetError::Connect { message, code } => {
                assert_eq!(message, "timed out");
                assert_eq!(code, 110);
            }
            other => panic!("unexpected error: {other}"),
        }

        let binding = dialer.binding();
        assert_eq!(binding.allocations(), 1);
        assert_eq!(binding.frees(), 1);
        assert_eq!(binding.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dial_allocation_failure() {
        let dialer = dialer();
        dialer.binding().fail_allocation();

        let err = dialer
            .dial(&DialContext::background(), "10.0.0.1:6378")
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::AllocationFailed));
        assert_eq!(dialer.binding().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dial_expired_deadline() {
        let dialer = dialer();
        let ctx = DialContext::with_deadline(Instant::now());

        let err = dialer.dial(&ctx, "10.0.0.1:6378").await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(dialer.binding().allocations(), 0);
    }

    #[tokio::test]
    async fn test_dial_close_read() {
        let dialer = dialer();
        let conn = dialer
            .dial(&DialContext::background(), "10.0.0.1:6378")
            .await
            .unwrap();
        let peer = conn.peer_addr();

        conn.close().await.unwrap();
        let mut buf = [0u8; 16];
        let err = tokio::time::timeout(Duration::from_secs(1), conn.read(&mut buf))
            .await
            .expect("read after close must not block")
            .unwrap_err();
        assert!(err.is_closed());
        assert_eq!(conn.peer_addr(), peer);
        assert_eq!(dialer.binding().frees(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_frees_once() {
        let dialer = dialer();
        let conn = Arc::new(
            dialer
                .dial(&DialContext::background(), "10.0.0.1:6378")
                .await
                .unwrap(),
        );

        let closers: Vec<_> = (0..32)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.close().await })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap().unwrap();
        }

        let binding = dialer.binding();
        assert_eq!(binding.frees(), 1);
        assert_eq!(binding.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_races_with_io() {
        let dialer = dialer();
        let conn = Arc::new(
            dialer
                .dial(&DialContext::background(), "10.0.0.1:6378")
                .await
                .unwrap(),
        );

        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                loop {
                    if let Err(err) = conn.write(b"data").await {
                        return err;
                    }
                }
            })
        };
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                loop {
                    if let Err(err) = conn.read(&mut buf).await {
                        return err;
                    }
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close().await.unwrap();

        assert!(writer.await.unwrap().is_closed());
        assert!(reader.await.unwrap().is_closed());
        assert_eq!(dialer.binding().frees(), 1);
    }
}
