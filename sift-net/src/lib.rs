//! sift-net - Outbound transport layer for the sift DNS proxy
//!
//! This crate provides the two building blocks the proxy core dials with:
//! - [`AioSocket`]: a uniform async connect/send/receive surface over UDP and
//!   TCP with timeouts and 2-byte DNS message framing on streams
//! - [`SocksOutboundProxy`]: SOCKS4/5 tunneling for TCP flows and SOCKS5
//!   UDP-association multiplexing for datagram flows
//!
//! [`Connector`] unifies the two so exchange code does not care whether a
//! flow is direct or proxied.

mod connector;
pub mod error;
mod socket;
mod socks;

pub use connector::{Connector, TcpFlow, UdpFlow};
pub use error::{Error, Result};
pub use socket::{with_timeout, AioSocket, Protocol, TcpDnsBuffer, MAX_STREAM_PAYLOAD, MAX_UDP_PAYLOAD};
pub use socks::{SocksAuth, SocksOutboundProxy, SocksProtocol, SocksProxySettings, SocksTcpTunnel, SocksUdpFlow};
