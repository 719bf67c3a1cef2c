//! Error types for the outbound transport layer

use thiserror::Error;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on sockets and proxied flows
#[derive(Debug, Error)]
pub enum Error {
    /// An operation did not complete within its timeout
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed the connection before the operation completed
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The proxy sent a reply that is malformed, oversized, or carries a
    /// failure status
    #[error("bad proxy reply: {0}")]
    BadProxyReply(&'static str),

    /// A UDP flow referenced an association that no longer exists
    #[error("UDP association not found")]
    UdpAssociationNotFound,

    /// The shared UDP association was torn down while flows were using it
    #[error("UDP association terminated: {0}")]
    UdpAssociationTerminated(String),

    /// A state machine handler ran in a state it does not accept
    #[error("invalid connection state: {0}")]
    InvalidConnState(&'static str),

    /// A connection id was registered twice
    #[error("duplicate connection id: {0}")]
    DuplicateId(u32),

    /// A connection id was not found in the table
    #[error("connection id not found: {0}")]
    ConnectionIdNotFound(u32),

    /// Data arrived on a control connection that must stay silent
    #[error("unexpected data on control connection ({0} bytes)")]
    UnexpectedData(usize),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut)
    }

    /// Check if this error indicates the transport went away and a retry on
    /// a fresh connection may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Io(_))
    }
}
