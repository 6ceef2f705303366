use rdstream_types::AddressParseError;
use thiserror::Error;

/// Errors that can occur in the networking layer.
#[derive(Debug, Error)]
pub enum NetError {
    /// The dial destination is not a valid `host:port` pair.
    #[error("invalid destination: {0}")]
    Parse(#[from] AddressParseError),

    /// The native transport failed to establish the connection.
    #[error("connect failed: {message} (code {code})")]
    Connect { message: String, code: i32 },

    /// The native transport could not allocate a connection context.
    #[error("native context allocation failed")]
    AllocationFailed,

    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A deadline elapsed before the operation completed.
    #[error("timeout")]
    Timeout,

    /// The native transport reported an error while moving data.
    #[error("transfer failed: {message} (code {code})")]
    Transfer { message: String, code: i32 },

    /// An I/O error from the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Whether this error is a deadline expiry. The connection that produced
    /// it is still usable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout)
    }

    /// Whether this error was caused by using a closed connection.
    pub fn is_closed(&self) -> bool {
        matches!(self, NetError::ConnectionClosed)
    }
}
