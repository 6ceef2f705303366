use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::conn::Conn;
use crate::error::NetError;

/// Per-call dial context carrying an optional deadline.
///
/// Cancellation of a dial is expressed only through this deadline; the
/// transport derives its connect timeout from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialContext {
    deadline: Option<Instant>,
}

impl DialContext {
    /// A context with no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline as of `now`, saturating at zero.
    /// `None` when no deadline is set.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// Whether the deadline has passed as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// Establishes connections to `"host:port"` destinations.
///
/// This is the pluggable dial strategy a client is configured with; the TCP
/// and RDMA transports each provide one.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: Conn;

    /// Dial `destination`. Returns either a live connection or an error,
    /// never both.
    async fn dial(&self, ctx: &DialContext, destination: &str) -> Result<Self::Conn, NetError>;
}
