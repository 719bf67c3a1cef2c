//! Unified outbound dialing: direct sockets or SOCKS-tunneled flows
//!
//! Upstream transports dial through a [`Connector`] and get the same DNS
//! framing surface either way; whether a flow crosses a proxy is decided by
//! configuration, not by the exchange code.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Result;
use crate::socket::AioSocket;
use crate::socks::{SocksOutboundProxy, SocksTcpTunnel, SocksUdpFlow};

/// Dials outbound flows, optionally through a SOCKS proxy
#[derive(Debug, Clone, Default)]
pub enum Connector {
    #[default]
    Direct,
    Socks(SocksOutboundProxy),
}

impl Connector {
    /// Open a UDP flow to `peer`, optionally dialing from a named interface
    pub async fn connect_udp(
        &self,
        peer: SocketAddr,
        interface: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<UdpFlow> {
        match self {
            Connector::Socks(proxy) if proxy.supports_udp() => {
                // The proxy decides the route; interface binding does not apply.
                Ok(UdpFlow::Proxied(proxy.connect_udp(peer, timeout).await?))
            }
            // A TCP-only proxy cannot carry datagrams; those flows go direct.
            Connector::Direct | Connector::Socks(_) => Ok(UdpFlow::Direct(
                AioSocket::connect_udp_on(peer, interface, timeout).await?,
            )),
        }
    }

    /// Open a TCP flow to `peer`, optionally dialing from a named interface
    pub async fn connect_tcp(
        &self,
        peer: SocketAddr,
        interface: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<TcpFlow> {
        match self {
            Connector::Direct => Ok(TcpFlow::Direct(
                AioSocket::connect_tcp_on(peer, interface, timeout).await?,
            )),
            Connector::Socks(proxy) => Ok(TcpFlow::Proxied(proxy.connect_tcp(peer, timeout).await?)),
        }
    }
}

/// A connected UDP flow, direct or proxied
pub enum UdpFlow {
    Direct(AioSocket),
    Proxied(SocksUdpFlow),
}

impl UdpFlow {
    pub async fn send_dns_packet(&mut self, data: &[u8]) -> Result<()> {
        match self {
            UdpFlow::Direct(socket) => socket.send_dns_packet(data).await,
            UdpFlow::Proxied(flow) => flow.send(data).await,
        }
    }

    pub async fn receive_dns_packet(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        match self {
            UdpFlow::Direct(socket) => socket.receive_dns_packet(timeout).await,
            UdpFlow::Proxied(flow) => flow.recv(timeout).await,
        }
    }
}

/// A connected TCP flow, direct or proxied
pub enum TcpFlow {
    Direct(AioSocket),
    Proxied(SocksTcpTunnel),
}

impl TcpFlow {
    pub async fn send_dns_packet(&mut self, data: &[u8]) -> Result<()> {
        match self {
            TcpFlow::Direct(socket) => socket.send_dns_packet(data).await,
            TcpFlow::Proxied(tunnel) => tunnel.send_dns_packet(data).await,
        }
    }

    pub async fn receive_dns_packet(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        match self {
            TcpFlow::Direct(socket) => socket.receive_dns_packet(timeout).await,
            TcpFlow::Proxied(tunnel) => tunnel.receive_dns_packet(timeout).await,
        }
    }
}

impl tokio::io::AsyncRead for TcpFlow {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpFlow::Direct(socket) => std::pin::Pin::new(socket).poll_read(cx, buf),
            TcpFlow::Proxied(tunnel) => std::pin::Pin::new(tunnel).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for TcpFlow {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TcpFlow::Direct(socket) => std::pin::Pin::new(socket).poll_write(cx, buf),
            TcpFlow::Proxied(tunnel) => std::pin::Pin::new(tunnel).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpFlow::Direct(socket) => std::pin::Pin::new(socket).poll_flush(cx),
            TcpFlow::Proxied(tunnel) => std::pin::Pin::new(tunnel).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpFlow::Direct(socket) => std::pin::Pin::new(socket).poll_shutdown(cx),
            TcpFlow::Proxied(tunnel) => std::pin::Pin::new(tunnel).poll_shutdown(cx),
        }
    }
}
