//! Error types for the DNS proxy core

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, DnsError>;

/// Errors that can occur while processing and exchanging DNS messages
#[derive(Debug, Error)]
pub enum DnsError {
    /// Transport-level failure (socket, SOCKS proxy)
    #[error("transport error: {0}")]
    Transport(#[from] sift_net::Error),

    /// Malformed DNS message
    #[error("decode error: {0}")]
    Decode(String),

    /// A DNS message could not be serialized
    #[error("encode error: {0}")]
    Encode(String),

    /// Bootstrap resolution of an upstream hostname failed
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// DoH request failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// QUIC connection or stream failure
    #[error("QUIC error: {0}")]
    Quic(String),

    /// DNSCrypt stamp, certificate, or sealing failure
    #[error("DNSCrypt error: {0}")]
    DnsCrypt(String),

    /// All candidate upstreams failed to produce a response
    #[error("upstreams exchange failed: {0}")]
    Exchange(String),

    /// The proxy is shutting down; the result must be discarded
    #[error("shutting down")]
    ShuttingDown,

    /// Invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl DnsError {
    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, DnsError::Transport(e) if e.is_timeout())
    }

    /// Servers sometimes drop a connection mid-exchange; such failures get
    /// exactly one retry on the same upstream. Timeouts do not.
    pub fn is_retriable(&self) -> bool {
        match self {
            DnsError::Transport(e) => e.is_transient(),
            DnsError::Http(_) | DnsError::Quic(_) => true,
            _ => false,
        }
    }
}

/// Errors returned by [`crate::DnsProxy::init`](crate::DnsProxy)
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid custom blocking IPv4 address: {0}")]
    InvalidIpv4(String),

    #[error("invalid custom blocking IPv6 address: {0}")]
    InvalidIpv6(String),

    #[error("failed to initialize any usable upstream")]
    UpstreamInit,

    #[error("failed to initialize the fallback filter: {0}")]
    FallbackFilterInit(String),

    #[error("failed to load filter lists: {0}")]
    FilterLoad(String),

    #[error("filter list ids are not unique")]
    NonUniqueFilterId,

    #[error("memory limit reached while loading filters")]
    MemLimitReached,

    #[error("failed to initialize a listener: {0}")]
    ListenerInit(String),
}
