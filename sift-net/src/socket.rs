//! Uniform async socket surface over UDP and TCP
//!
//! Upstream exchanges and the SOCKS handshake all speak through [`AioSocket`]:
//! one connect/send/receive surface regardless of transport, with optional
//! timeouts and the 2-byte big-endian DNS message framing applied on TCP.
//! The framing never leaves this layer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::{Error, Result};

/// Maximum DNS message size carried over UDP
pub const MAX_UDP_PAYLOAD: usize = 65535;

/// Maximum DNS message size carried over a framed stream
pub const MAX_STREAM_PAYLOAD: usize = 65535;

/// Transport protocol of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Run a future under an optional timeout, mapping expiry to [`Error::TimedOut`]
pub async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout {
        Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| Error::TimedOut)?,
        None => fut.await,
    }
}

/// Pick an unspecified local address in the peer's address family
pub fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    if peer.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

fn socket2_domain(peer: SocketAddr) -> socket2::Domain {
    if peer.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_device(socket: &socket2::Socket, interface: &str) -> std::io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_device(_socket: &socket2::Socket, interface: &str) -> std::io::Result<()> {
    log::debug!("interface binding to '{}' is not supported on this platform", interface);
    Ok(())
}

/// Accumulates TCP stream chunks and extracts length-prefixed DNS messages
#[derive(Debug, Default)]
pub struct TcpDnsBuffer {
    buf: Vec<u8>,
}

impl TcpDnsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of raw stream data
    pub fn store(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next whole message, if one is buffered
    pub fn extract_packet(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let packet = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        Some(packet)
    }
}

/// A connected datagram or stream socket with a single in-flight operation
///
/// The `&mut self` receivers make overlapping async operations on one socket
/// unrepresentable, which is the contract the rest of the crate relies on.
#[derive(Debug)]
pub enum AioSocket {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl AioSocket {
    /// Open a UDP socket connected to `peer`
    pub async fn connect_udp(peer: SocketAddr, timeout: Option<Duration>) -> Result<Self> {
        Self::connect_udp_on(peer, None, timeout).await
    }

    /// Open a UDP socket connected to `peer`, dialing from a specific
    /// network interface when one is named
    pub async fn connect_udp_on(
        peer: SocketAddr,
        interface: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        with_timeout(timeout, async {
            let socket = match interface {
                Some(interface) => {
                    let raw = socket2::Socket::new(
                        socket2_domain(peer),
                        socket2::Type::DGRAM,
                        Some(socket2::Protocol::UDP),
                    )?;
                    bind_to_device(&raw, interface)?;
                    raw.set_nonblocking(true)?;
                    raw.bind(&unspecified_for(peer).into())?;
                    UdpSocket::from_std(raw.into())?
                }
                None => UdpSocket::bind(unspecified_for(peer)).await?,
            };
            socket.connect(peer).await?;
            Ok(AioSocket::Udp(socket))
        })
        .await
    }

    /// Open a TCP connection to `peer`
    pub async fn connect_tcp(peer: SocketAddr, timeout: Option<Duration>) -> Result<Self> {
        Self::connect_tcp_on(peer, None, timeout).await
    }

    /// Open a TCP connection to `peer`, dialing from a specific network
    /// interface when one is named
    pub async fn connect_tcp_on(
        peer: SocketAddr,
        interface: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        with_timeout(timeout, async {
            let stream = match interface {
                Some(interface) => {
                    let raw = socket2::Socket::new(
                        socket2_domain(peer),
                        socket2::Type::STREAM,
                        Some(socket2::Protocol::TCP),
                    )?;
                    bind_to_device(&raw, interface)?;
                    raw.set_nonblocking(true)?;
                    // A non-blocking connect reports "in progress" and
                    // completes when the socket turns writable.
                    match raw.connect(&peer.into()) {
                        Ok(()) => {}
                        Err(e)
                            if e.raw_os_error() == Some(115)
                                || e.raw_os_error() == Some(36)
                                || e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e.into()),
                    }
                    let stream = TcpStream::from_std(raw.into())?;
                    stream.ready(tokio::io::Interest::WRITABLE).await?;
                    if let Some(e) = stream.take_error()? {
                        return Err(e.into());
                    }
                    stream
                }
                None => TcpStream::connect(peer).await?,
            };
            Ok(AioSocket::Tcp(stream))
        })
        .await
    }

    /// Wrap an already-established stream (e.g. a SOCKS tunnel)
    pub fn from_tcp(stream: TcpStream) -> Self {
        AioSocket::Tcp(stream)
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            AioSocket::Udp(_) => Protocol::Udp,
            AioSocket::Tcp(_) => Protocol::Tcp,
        }
    }

    /// Send raw bytes: one datagram on UDP, pipelined on TCP
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            AioSocket::Udp(socket) => {
                socket.send(data).await?;
            }
            AioSocket::Tcp(stream) => {
                stream.write_all(data).await?;
            }
        }
        Ok(())
    }

    /// Send a DNS message, applying the 2-byte length prefix on TCP
    pub async fn send_dns_packet(&mut self, data: &[u8]) -> Result<()> {
        match self {
            AioSocket::Udp(socket) => {
                socket.send(data).await?;
            }
            AioSocket::Tcp(stream) => {
                let mut framed = Vec::with_capacity(2 + data.len());
                framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
                framed.extend_from_slice(data);
                stream.write_all(&framed).await?;
            }
        }
        Ok(())
    }

    /// Deliver raw chunks to `on_chunk` until it reports completion
    ///
    /// The callback returns `true` once it has seen everything it needs.
    /// Completion is signalled exactly once: `Ok` after the callback is done,
    /// [`Error::TimedOut`] on expiry, or the transport error otherwise. A
    /// stream that ends before the callback is done yields
    /// [`Error::ConnectionClosed`].
    pub async fn receive<F>(&mut self, mut on_chunk: F, timeout: Option<Duration>) -> Result<()>
    where
        F: FnMut(&[u8]) -> bool,
    {
        with_timeout(timeout, async {
            let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
            loop {
                let n = match self {
                    AioSocket::Udp(socket) => socket.recv(&mut buf).await?,
                    AioSocket::Tcp(stream) => {
                        let n = stream.read(&mut buf).await?;
                        if n == 0 {
                            return Err(Error::ConnectionClosed);
                        }
                        n
                    }
                };
                if on_chunk(&buf[..n]) {
                    return Ok(());
                }
            }
        })
        .await
    }

    /// Receive one whole DNS message, stripping the TCP framing
    pub async fn receive_dns_packet(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let protocol = self.protocol();
        let mut tcp_buffer = TcpDnsBuffer::new();
        let mut reply: Option<Vec<u8>> = None;
        self.receive(
            |chunk| match protocol {
                Protocol::Udp => {
                    reply = Some(chunk.to_vec());
                    true
                }
                Protocol::Tcp => {
                    tcp_buffer.store(chunk);
                    match tcp_buffer.extract_packet() {
                        Some(packet) => {
                            reply = Some(packet);
                            true
                        }
                        None => false,
                    }
                }
            },
            timeout,
        )
        .await?;
        reply.ok_or(Error::ConnectionClosed)
    }
}

// The socket doubles as a byte stream so TLS and other layers can sit on
// top of either transport: a connected UDP socket maps one datagram per
// read/write.
impl tokio::io::AsyncRead for AioSocket {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            AioSocket::Udp(socket) => socket.poll_recv(cx, buf),
            AioSocket::Tcp(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for AioSocket {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AioSocket::Udp(socket) => socket.poll_send(cx, buf),
            AioSocket::Tcp(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            AioSocket::Udp(_) => std::task::Poll::Ready(Ok(())),
            AioSocket::Tcp(stream) => std::pin::Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            AioSocket::Udp(_) => std::task::Poll::Ready(Ok(())),
            AioSocket::Tcp(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_dns_buffer_whole_packet() {
        let mut buf = TcpDnsBuffer::new();
        buf.store(&[0x00, 0x03, 0xaa, 0xbb, 0xcc]);
        assert_eq!(buf.extract_packet(), Some(vec![0xaa, 0xbb, 0xcc]));
        assert_eq!(buf.extract_packet(), None);
    }

    #[test]
    fn test_tcp_dns_buffer_split_packet() {
        let mut buf = TcpDnsBuffer::new();
        buf.store(&[0x00]);
        assert_eq!(buf.extract_packet(), None);
        buf.store(&[0x02, 0x01]);
        assert_eq!(buf.extract_packet(), None);
        buf.store(&[0x02]);
        assert_eq!(buf.extract_packet(), Some(vec![0x01, 0x02]));
    }

    #[test]
    fn test_tcp_dns_buffer_two_packets_one_chunk() {
        let mut buf = TcpDnsBuffer::new();
        buf.store(&[0x00, 0x01, 0xaa, 0x00, 0x01, 0xbb]);
        assert_eq!(buf.extract_packet(), Some(vec![0xaa]));
        assert_eq!(buf.extract_packet(), Some(vec![0xbb]));
    }

    #[tokio::test]
    async fn test_udp_round_trip_has_no_framing() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, src) = server.recv_from(&mut buf).await.unwrap();
            // Echo back exactly what arrived: no length prefix expected.
            assert_eq!(&buf[..n], b"\x12\x34rest");
            server.send_to(&buf[..n], src).await.unwrap();
        });

        let mut sock = AioSocket::connect_udp(server_addr, None).await.unwrap();
        sock.send_dns_packet(b"\x12\x34rest").await.unwrap();
        let reply = sock
            .receive_dns_packet(Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply, b"\x12\x34rest");
    }

    #[tokio::test]
    async fn test_tcp_round_trip_applies_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut prefix = [0u8; 2];
            stream.read_exact(&mut prefix).await.unwrap();
            let len = u16::from_be_bytes(prefix) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();
            // Reply with the same message, framed, split across writes.
            stream.write_all(&prefix).await.unwrap();
            stream.write_all(&body[..1]).await.unwrap();
            stream.flush().await.unwrap();
            stream.write_all(&body[1..]).await.unwrap();
        });

        let mut sock = AioSocket::connect_tcp(addr, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        sock.send_dns_packet(b"\xab\xcdquery").await.unwrap();
        let reply = sock
            .receive_dns_packet(Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply, b"\xab\xcdquery");
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut sock = AioSocket::connect_udp(server_addr, None).await.unwrap();
        let err = sock
            .receive_dns_packet(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
