//! Single-owner wrapper around a native connection context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rdstream_net::NetError;

use crate::binding::NativeBinding;

/// Owns exactly one native context and releases it exactly once.
///
/// Native calls run under a shared guard on the context. `close` flips the
/// `closed` flag with a compare-and-set; only the winner takes the exclusive
/// guard (waiting for in-flight calls to leave), moves the context out and
/// hands it to the binding's `close`. Dropping an unclosed handle takes the
/// same path.
pub(crate) struct NativeHandle<B: NativeBinding> {
    binding: Arc<B>,
    closed: AtomicBool,
    ctx: RwLock<Option<B::Context>>,
}

impl<B: NativeBinding> NativeHandle<B> {
    pub(crate) fn new(binding: Arc<B>, ctx: B::Context) -> Self {
        Self {
            binding,
            closed: AtomicBool::new(false),
            ctx: RwLock::new(Some(ctx)),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `f` against the live context, or fail with `ConnectionClosed`.
    pub(crate) fn with_context<R>(
        &self,
        f: impl FnOnce(&B, &B::Context) -> R,
    ) -> Result<R, NetError> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        let guard = self.ctx.read();
        match guard.as_ref() {
            Some(ctx) => Ok(f(&self.binding, ctx)),
            None => Err(NetError::ConnectionClosed),
        }
    }

    /// Release the context. Returns `true` for the one call that did.
    pub(crate) fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let ctx = self.ctx.write().take();
        if let Some(ctx) = ctx {
            self.binding.close(ctx);
        }
        true
    }
}

/// Releases inline on whichever thread drops the last reference, which may
/// be an async worker. `RdmaConnection::close` releases on the blocking pool;
/// callers holding a binding whose `close` can stall should close explicitly
/// rather than rely on drop.
impl<B: NativeBinding> Drop for NativeHandle<B> {
    fn drop(&mut self) {
        if self.close() {
            tracing::debug!("released native RDMA context on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBinding;

    fn handle(binding: &Arc<LoopbackBinding>) -> NativeHandle<LoopbackBinding> {
        let ctx = binding.allocate().unwrap();
        NativeHandle::new(Arc::clone(binding), ctx)
    }

    #[test]
    fn test_close_releases_once() {
        let binding = Arc::new(LoopbackBinding::new());
        let h = handle(&binding);

        assert!(!h.is_closed());
        assert!(h.close());
        assert!(!h.close());
        assert!(h.is_closed());
        assert_eq!(binding.frees(), 1);

        drop(h);
        assert_eq!(binding.frees(), 1);
        assert_eq!(binding.outstanding(), 0);
    }

    #[test]
    fn test_drop_releases_unclosed() {
        let binding = Arc::new(LoopbackBinding::new());
        let h = handle(&binding);
        assert_eq!(binding.outstanding(), 1);

        drop(h);
        assert_eq!(binding.frees(), 1);
        assert_eq!(binding.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_drop_inside_runtime_releases_inline() {
        let binding = Arc::new(LoopbackBinding::new());
        drop(handle(&binding));
        assert_eq!(binding.frees(), 1);
        assert_eq!(binding.outstanding(), 0);
    }

    #[test]
    fn test_with_context_after_close() {
        let binding = Arc::new(LoopbackBinding::new());
        let h = handle(&binding);
        assert!(h.with_context(|b, ctx| b.error_code(ctx)).is_ok());

        h.close();
        let err = h.with_context(|b, ctx| b.error_code(ctx)).unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn test_concurrent_close_from_threads() {
        let binding = Arc::new(LoopbackBinding::new());
        let h = Arc::new(handle(&binding));

        let winners: usize = std::thread::scope(|s| {
            let joins: Vec<_> = (0..16)
                .map(|_| {
                    let h = Arc::clone(&h);
                    s.spawn(move || h.close())
                })
                .collect();
            joins.into_iter().map(|j| usize::from(j.join().unwrap())).sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(binding.frees(), 1);
    }
}
