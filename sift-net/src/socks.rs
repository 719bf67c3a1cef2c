//! SOCKS4/5 outbound proxy
//!
//! Tunnels TCP flows and multiplexed UDP flows through a SOCKS server.
//! TCP flows get a dedicated tunnel each. UDP flows on one proxy instance
//! share a single UDP association: the first flow negotiates it over a
//! synthetic TCP control connection, concurrent flows park until the relay's
//! bound address is known, and the association is torn down together with the
//! control connection when the last UDP flow closes.
//!
//! Wire format is RFC 1928/1929 for SOCKS5 and the pre-RFC protocol for
//! SOCKS4 (IPv4 only, NUL-terminated user id, no domain addresses).

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::socket::{unspecified_for, with_timeout, AioSocket, Protocol, MAX_UDP_PAYLOAD};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;

// SOCKS4 reply: VN is always 0, CD 90 (decimal) grants the request.
const S4_REPLY_VERSION: u8 = 0x00;
const S4_CMD_CONNECT: u8 = 0x01;
const S4_REQUEST_GRANTED: u8 = 0x5a;
const S4_REPLY_LEN: usize = 8;

const S5_AUTH_NONE: u8 = 0x00;
const S5_AUTH_USER_PASS: u8 = 0x02;
const S5_CMD_CONNECT: u8 = 0x01;
const S5_CMD_UDP_ASSOCIATE: u8 = 0x03;
const S5_ATYP_IPV4: u8 = 0x01;
const S5_ATYP_IPV6: u8 = 0x04;
const S5_REPLY_SUCCEEDED: u8 = 0x00;
const S5_USER_PASS_VERSION: u8 = 0x01;
const S5_USER_PASS_SUCCESS: u8 = 0x00;

/// User id sent in SOCKS4 CONNECT requests, NUL terminator included
const S4_USER_ID: &[u8] = b"sift\0";

/// Process-wide connection id source; ids are never reused
static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

fn next_conn_id() -> u32 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// SOCKS protocol variant spoken with the proxy server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksProtocol {
    /// SOCKS4, TCP only
    Socks4,
    /// SOCKS5, TCP only
    Socks5,
    /// SOCKS5 with UDP ASSOCIATE support
    Socks5Udp,
}

/// RFC 1929 username/password credentials
#[derive(Clone)]
pub struct SocksAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SocksAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Settings for an outbound SOCKS proxy
#[derive(Clone)]
pub struct SocksProxySettings {
    pub protocol: SocksProtocol,
    /// Resolved address of the proxy server
    pub address: SocketAddr,
    pub auth: Option<SocksAuth>,
    /// Invoked when the proxy server itself cannot be reached
    pub on_proxy_connection_failed: Option<Arc<dyn Fn(&Error) + Send + Sync>>,
}

impl fmt::Debug for SocksProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksProxySettings")
            .field("protocol", &self.protocol)
            .field("address", &self.address)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Connection state, tracked in the table for every live flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    Idle,
    ConnectingSocket,
    ConnectingSocks,
    S5Auth,
    S5Tunnel,
    Connected,
    Closing,
}

/// Handshake state machine; reply-reading states carry the partial reply
enum HandshakeState {
    ConnectingSocks { reply: Vec<u8> },
    S5Auth { reply: Vec<u8> },
    S5Tunnel { reply: Vec<u8> },
    Connected { bound: Option<SocketAddr> },
}

impl HandshakeState {
    fn phase(&self) -> ConnPhase {
        match self {
            HandshakeState::ConnectingSocks { .. } => ConnPhase::ConnectingSocks,
            HandshakeState::S5Auth { .. } => ConnPhase::S5Auth,
            HandshakeState::S5Tunnel { .. } => ConnPhase::S5Tunnel,
            HandshakeState::Connected { .. } => ConnPhase::Connected,
        }
    }
}

#[derive(Debug)]
struct ConnEntry {
    proto: Protocol,
    phase: ConnPhase,
}

/// State of the shared UDP association, published to every flow
#[derive(Debug, Clone)]
enum AssocState {
    Negotiating,
    Connected(SocketAddr),
    Terminated(String),
}

struct UdpAssociation {
    control_conn_id: u32,
    state_tx: Arc<watch::Sender<AssocState>>,
    state_rx: watch::Receiver<AssocState>,
    monitor: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<u32, ConnEntry>,
    udp_association: Option<UdpAssociation>,
}

struct ProxyInner {
    settings: SocksProxySettings,
    guard: Mutex<Tables>,
}

/// Outbound SOCKS proxy with a shared connection table
///
/// Cheap to clone; clones share the table and the UDP association.
#[derive(Clone)]
pub struct SocksOutboundProxy {
    inner: Arc<ProxyInner>,
}

impl fmt::Debug for SocksOutboundProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksOutboundProxy")
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl SocksOutboundProxy {
    pub fn new(settings: SocksProxySettings) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                settings,
                guard: Mutex::new(Tables::default()),
            }),
        }
    }

    pub fn settings(&self) -> &SocksProxySettings {
        &self.inner.settings
    }

    /// Whether this proxy can carry UDP flows
    pub fn supports_udp(&self) -> bool {
        self.inner.settings.protocol == SocksProtocol::Socks5Udp
    }

    /// Number of live connection table entries
    pub fn connection_count(&self) -> usize {
        self.inner.guard.lock().unwrap().connections.len()
    }

    /// Whether a UDP association currently exists
    pub fn has_udp_association(&self) -> bool {
        self.inner.guard.lock().unwrap().udp_association.is_some()
    }

    /// Open a TCP flow to `peer` tunneled through the proxy
    pub async fn connect_tcp(
        &self,
        peer: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<SocksTcpTunnel> {
        let id = next_conn_id();
        self.inner.register(id, Protocol::Tcp)?;
        self.inner.set_phase(id, ConnPhase::ConnectingSocket);

        let result = with_timeout(timeout, self.inner.establish_tcp_tunnel(id, peer)).await;
        match result {
            Ok(stream) => {
                self.inner.set_phase(id, ConnPhase::Connected);
                Ok(SocksTcpTunnel {
                    id,
                    proxy: self.inner.clone(),
                    socket: AioSocket::from_tcp(stream),
                })
            }
            Err(e) => {
                self.inner.remove(id);
                Err(e)
            }
        }
    }

    /// Open a UDP flow to `peer` through the shared UDP association
    ///
    /// The first flow starts the association; flows arriving while it is
    /// negotiating park until the relay's bound address is published.
    pub async fn connect_udp(
        &self,
        peer: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<SocksUdpFlow> {
        if !self.supports_udp() {
            return Err(Error::InvalidConnState("proxy protocol does not support UDP"));
        }

        let id = next_conn_id();
        let mut state_rx = {
            let mut tables = self.inner.guard.lock().unwrap();
            if tables.connections.contains_key(&id) {
                return Err(Error::DuplicateId(id));
            }
            tables.connections.insert(
                id,
                ConnEntry {
                    proto: Protocol::Udp,
                    phase: ConnPhase::ConnectingSocket,
                },
            );

            match &tables.udp_association {
                Some(assoc) => assoc.state_rx.clone(),
                None => {
                    let control_id = next_conn_id();
                    let (tx, rx) = watch::channel(AssocState::Negotiating);
                    let tx = Arc::new(tx);
                    tables.connections.insert(
                        control_id,
                        ConnEntry {
                            proto: Protocol::Tcp,
                            phase: ConnPhase::ConnectingSocket,
                        },
                    );
                    log::debug!("[id={}] starting UDP association", control_id);
                    let inner = self.inner.clone();
                    let task_tx = tx.clone();
                    let monitor = tokio::spawn(async move {
                        inner.run_udp_association(control_id, task_tx, timeout).await;
                    });
                    tables.udp_association = Some(UdpAssociation {
                        control_conn_id: control_id,
                        state_tx: tx,
                        state_rx: rx.clone(),
                        monitor: Some(monitor),
                    });
                    rx
                }
            }
        };

        let result = with_timeout(timeout, async {
            // Park until the association reports its bound address.
            let bound = loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    AssocState::Connected(addr) => break addr,
                    AssocState::Terminated(cause) => {
                        return Err(Error::UdpAssociationTerminated(cause));
                    }
                    AssocState::Negotiating => {
                        if state_rx.changed().await.is_err() {
                            return Err(Error::UdpAssociationNotFound);
                        }
                    }
                }
            };

            let socket = UdpSocket::bind(unspecified_for(bound)).await?;
            socket.connect(bound).await?;
            Ok((socket, state_rx.clone()))
        })
        .await;

        match result {
            Ok((socket, state_rx)) => {
                self.inner.set_phase(id, ConnPhase::Connected);
                Ok(SocksUdpFlow {
                    id,
                    peer,
                    socket,
                    proxy: self.inner.clone(),
                    state_rx,
                })
            }
            Err(e) => {
                self.inner.on_udp_flow_closed(id);
                Err(e)
            }
        }
    }
}

impl ProxyInner {
    /// Register a fresh connection in the `Idle` phase
    fn register(&self, id: u32, proto: Protocol) -> Result<()> {
        let mut tables = self.guard.lock().unwrap();
        if tables.connections.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }
        tables.connections.insert(
            id,
            ConnEntry {
                proto,
                phase: ConnPhase::Idle,
            },
        );
        Ok(())
    }

    fn set_phase(&self, id: u32, phase: ConnPhase) {
        if let Some(entry) = self.guard.lock().unwrap().connections.get_mut(&id) {
            entry.phase = phase;
        }
    }

    fn remove(&self, id: u32) {
        self.guard.lock().unwrap().connections.remove(&id);
    }

    fn notify_proxy_unreachable(&self, error: &Error) {
        if let Some(cb) = &self.settings.on_proxy_connection_failed {
            cb(error);
        }
    }

    /// Connect to the proxy server and negotiate a CONNECT tunnel
    async fn establish_tcp_tunnel(&self, id: u32, peer: SocketAddr) -> Result<TcpStream> {
        let mut stream = match TcpStream::connect(self.settings.address).await {
            Ok(s) => s,
            Err(e) => {
                let e = Error::Io(e);
                self.notify_proxy_unreachable(&e);
                return Err(e);
            }
        };
        self.handshake(id, &mut stream, peer, false).await?;
        Ok(stream)
    }

    /// Negotiate the UDP association, then watch its control channel
    async fn run_udp_association(
        self: Arc<Self>,
        control_id: u32,
        state_tx: Arc<watch::Sender<AssocState>>,
        timeout: Option<Duration>,
    ) {
        let negotiated = with_timeout(timeout, async {
            let mut stream = match TcpStream::connect(self.settings.address).await {
                Ok(s) => s,
                Err(e) => {
                    let e = Error::Io(e);
                    self.notify_proxy_unreachable(&e);
                    return Err(e);
                }
            };
            // ASSOCIATE with an unspecified client address: datagrams will
            // originate from a socket we have not bound yet.
            let client_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
            let bound = self
                .handshake(control_id, &mut stream, client_addr, true)
                .await?
                .ok_or(Error::BadProxyReply("no bound address in ASSOCIATE reply"))?;
            Ok((stream, bound))
        })
        .await;

        match negotiated {
            Ok((stream, bound)) => {
                log::debug!("[id={}] UDP association bound to {}", control_id, bound);
                let _ = state_tx.send(AssocState::Connected(bound));
                self.monitor_control_channel(control_id, stream, state_tx).await;
            }
            Err(e) => {
                log::debug!("[id={}] UDP association failed: {}", control_id, e);
                self.terminate_udp_association(&e.to_string());
            }
        }
    }

    /// The only legitimate traffic on a connected control channel is silence
    async fn monitor_control_channel(
        self: &Arc<Self>,
        control_id: u32,
        mut stream: TcpStream,
        _state_tx: Arc<watch::Sender<AssocState>>,
    ) {
        let mut buf = [0u8; 512];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    log::debug!("[id={}] control connection closed", control_id);
                    self.terminate_udp_association("control connection closed");
                    return;
                }
                Ok(n) => {
                    let e = Error::UnexpectedData(n);
                    log::debug!("[id={}] {}", control_id, e);
                    self.terminate_udp_association(&e.to_string());
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    // Idle-read timeout on an established control channel is
                    // normal; the association stays up.
                    continue;
                }
                Err(e) => {
                    log::debug!("[id={}] control connection error: {}", control_id, e);
                    self.terminate_udp_association(&e.to_string());
                    return;
                }
            }
        }
    }

    /// Tear down the association and fail every UDP flow on it
    fn terminate_udp_association(&self, cause: &str) {
        let mut tables = self.guard.lock().unwrap();
        let Some(assoc) = tables.udp_association.take() else {
            return;
        };
        tables.connections.remove(&assoc.control_conn_id);
        tables
            .connections
            .retain(|_, entry| entry.proto != Protocol::Udp);
        drop(tables);

        let _ = assoc.state_tx.send(AssocState::Terminated(cause.to_string()));
        if let Some(monitor) = assoc.monitor {
            // Cleanup is complete; if this is the monitor itself the abort
            // lands after it returns.
            monitor.abort();
        }
    }

    /// Deregister a UDP flow; the last one takes the association down with it
    fn on_udp_flow_closed(&self, id: u32) {
        let mut tables = self.guard.lock().unwrap();
        tables.connections.remove(&id);
        let udp_flows_left = tables
            .connections
            .values()
            .any(|entry| entry.proto == Protocol::Udp);
        if udp_flows_left {
            return;
        }
        let Some(assoc) = tables.udp_association.take() else {
            return;
        };
        log::debug!(
            "[id={}] last UDP flow closed, terminating association",
            assoc.control_conn_id
        );
        tables.connections.remove(&assoc.control_conn_id);
        drop(tables);

        let _ = assoc
            .state_tx
            .send(AssocState::Terminated("association closed".into()));
        if let Some(monitor) = assoc.monitor {
            monitor.abort();
        }
    }

    /// Drive the SOCKS handshake on `stream` until `Connected`
    ///
    /// Returns the bound address from the reply for UDP ASSOCIATE requests.
    /// Input is consumed in whatever chunks the transport delivers; every
    /// reply is validated against its exact expected size and anything longer
    /// is a [`Error::BadProxyReply`].
    async fn handshake(
        &self,
        conn_id: u32,
        stream: &mut TcpStream,
        dst: SocketAddr,
        udp_associate: bool,
    ) -> Result<Option<SocketAddr>> {
        let mut state = match self.settings.protocol {
            SocksProtocol::Socks4 => {
                stream.write_all(&encode_socks4_connect(dst)?).await?;
                HandshakeState::ConnectingSocks { reply: Vec::new() }
            }
            SocksProtocol::Socks5 | SocksProtocol::Socks5Udp => {
                stream
                    .write_all(&encode_socks5_method_request(self.settings.auth.is_some()))
                    .await?;
                HandshakeState::ConnectingSocks { reply: Vec::new() }
            }
        };
        self.set_phase(conn_id, state.phase());

        let socks4 = self.settings.protocol == SocksProtocol::Socks4;
        let cmd = if udp_associate { S5_CMD_UDP_ASSOCIATE } else { S5_CMD_CONNECT };

        let mut buf = [0u8; 512];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            let mut chunk = &buf[..n];

            // A reply may arrive split across reads; each state buffers until
            // its fixed size is reached and rejects anything beyond it.
            while !chunk.is_empty() {
                state = match state {
                    HandshakeState::ConnectingSocks { mut reply } if socks4 => {
                        match take_reply(&mut reply, &mut chunk, S4_REPLY_LEN)? {
                            None => HandshakeState::ConnectingSocks { reply },
                            Some(data) => {
                                parse_socks4_reply(&data)?;
                                HandshakeState::Connected { bound: None }
                            }
                        }
                    }
                    HandshakeState::ConnectingSocks { mut reply } => {
                        match take_reply(&mut reply, &mut chunk, 2)? {
                            None => HandshakeState::ConnectingSocks { reply },
                            Some(data) => {
                                let method = parse_socks5_method_reply(&data)?;
                                if method == S5_AUTH_USER_PASS {
                                    let auth = self.settings.auth.as_ref().ok_or(
                                        Error::BadProxyReply("auth requested but not configured"),
                                    )?;
                                    stream.write_all(&encode_socks5_auth(auth)).await?;
                                    HandshakeState::S5Auth { reply: Vec::new() }
                                } else {
                                    stream.write_all(&encode_socks5_connect(cmd, dst)).await?;
                                    HandshakeState::S5Tunnel { reply: Vec::new() }
                                }
                            }
                        }
                    }
                    HandshakeState::S5Auth { mut reply } => {
                        match take_reply(&mut reply, &mut chunk, 2)? {
                            None => HandshakeState::S5Auth { reply },
                            Some(data) => {
                                parse_socks5_auth_reply(&data)?;
                                stream.write_all(&encode_socks5_connect(cmd, dst)).await?;
                                HandshakeState::S5Tunnel { reply: Vec::new() }
                            }
                        }
                    }
                    HandshakeState::S5Tunnel { mut reply } => {
                        match take_connect_reply(&mut reply, &mut chunk)? {
                            None => HandshakeState::S5Tunnel { reply },
                            Some(bound) => HandshakeState::Connected { bound: Some(bound) },
                        }
                    }
                    HandshakeState::Connected { .. } => {
                        return Err(Error::BadProxyReply("data after handshake completion"));
                    }
                };
                self.set_phase(conn_id, state.phase());
            }

            if let HandshakeState::Connected { bound } = &state {
                return Ok(*bound);
            }
        }
    }
}

/// A TCP flow tunneled through the proxy
///
/// Dropping the tunnel removes its connection table entry.
pub struct SocksTcpTunnel {
    id: u32,
    proxy: Arc<ProxyInner>,
    socket: AioSocket,
}

impl fmt::Debug for SocksTcpTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksTcpTunnel").field("id", &self.id).finish()
    }
}

impl SocksTcpTunnel {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.socket.send(data).await
    }

    pub async fn send_dns_packet(&mut self, data: &[u8]) -> Result<()> {
        self.socket.send_dns_packet(data).await
    }

    pub async fn receive_dns_packet(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.socket.receive_dns_packet(timeout).await
    }
}

impl Drop for SocksTcpTunnel {
    fn drop(&mut self) {
        self.proxy.set_phase(self.id, ConnPhase::Closing);
        self.proxy.remove(self.id);
    }
}

// After the handshake the tunnel is a transparent byte pipe; expose it as a
// stream so TLS can run over it.
impl tokio::io::AsyncRead for SocksTcpTunnel {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().socket).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for SocksTcpTunnel {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().socket).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().socket).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().socket).poll_shutdown(cx)
    }
}

/// A logical UDP flow multiplexed over the shared association
///
/// Datagrams are wrapped in the SOCKS5 UDP header on send and unwrapped on
/// receive. Dropping the last flow tears down the association.
pub struct SocksUdpFlow {
    id: u32,
    peer: SocketAddr,
    socket: UdpSocket,
    proxy: Arc<ProxyInner>,
    state_rx: watch::Receiver<AssocState>,
}

impl SocksUdpFlow {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn check_association(&self) -> Result<()> {
        match &*self.state_rx.borrow() {
            AssocState::Terminated(cause) => Err(Error::UdpAssociationTerminated(cause.clone())),
            _ => Ok(()),
        }
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.check_association()?;
        let mut packet = encode_udp_header(self.peer);
        packet.extend_from_slice(data);
        self.socket.send(&packet).await?;
        Ok(())
    }

    pub async fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.check_association()?;
        let socket = &self.socket;
        let state_rx = &mut self.state_rx;
        with_timeout(timeout, async {
            let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
            loop {
                tokio::select! {
                    received = socket.recv(&mut buf) => {
                        let n = received?;
                        // Datagrams without a well-formed relay header are dropped.
                        if let Ok((header_len, _)) = parse_udp_header(&buf[..n]) {
                            return Ok(buf[header_len..n].to_vec());
                        }
                    }
                    _ = state_rx.changed() => {
                        match &*state_rx.borrow() {
                            AssocState::Terminated(cause) => {
                                return Err(Error::UdpAssociationTerminated(cause.clone()));
                            }
                            // Sender gone without a terminal state.
                            _ if state_rx.has_changed().is_err() => {
                                return Err(Error::UdpAssociationNotFound);
                            }
                            _ => {}
                        }
                    }
                }
            }
        })
        .await
    }
}

impl Drop for SocksUdpFlow {
    fn drop(&mut self) {
        self.proxy.on_udp_flow_closed(self.id);
    }
}

// Wire encoding / decoding

fn encode_socks4_connect(dst: SocketAddr) -> Result<Vec<u8>> {
    let SocketAddr::V4(dst) = dst else {
        return Err(Error::InvalidConnState("SOCKS4 supports IPv4 destinations only"));
    };
    let mut req = Vec::with_capacity(8 + S4_USER_ID.len());
    req.push(SOCKS4_VERSION);
    req.push(S4_CMD_CONNECT);
    req.extend_from_slice(&dst.port().to_be_bytes());
    req.extend_from_slice(&dst.ip().octets());
    req.extend_from_slice(S4_USER_ID);
    Ok(req)
}

fn parse_socks4_reply(data: &[u8]) -> Result<()> {
    if data[0] != S4_REPLY_VERSION {
        return Err(Error::BadProxyReply("malformed SOCKS4 version"));
    }
    if data[1] != S4_REQUEST_GRANTED {
        return Err(Error::BadProxyReply("SOCKS4 request rejected"));
    }
    Ok(())
}

fn encode_socks5_method_request(with_auth: bool) -> Vec<u8> {
    if with_auth {
        vec![SOCKS5_VERSION, 2, S5_AUTH_NONE, S5_AUTH_USER_PASS]
    } else {
        vec![SOCKS5_VERSION, 1, S5_AUTH_NONE]
    }
}

fn parse_socks5_method_reply(data: &[u8]) -> Result<u8> {
    if data[0] != SOCKS5_VERSION {
        return Err(Error::BadProxyReply("malformed SOCKS5 version"));
    }
    match data[1] {
        m @ (S5_AUTH_NONE | S5_AUTH_USER_PASS) => Ok(m),
        _ => Err(Error::BadProxyReply("unsupported authentication method")),
    }
}

fn encode_socks5_auth(auth: &SocksAuth) -> Vec<u8> {
    let user = &auth.username.as_bytes()[..auth.username.len().min(255)];
    let pass = &auth.password.as_bytes()[..auth.password.len().min(255)];
    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(S5_USER_PASS_VERSION);
    req.push(user.len() as u8);
    req.extend_from_slice(user);
    req.push(pass.len() as u8);
    req.extend_from_slice(pass);
    req
}

fn parse_socks5_auth_reply(data: &[u8]) -> Result<()> {
    if data[0] != S5_USER_PASS_VERSION {
        return Err(Error::BadProxyReply("malformed auth version"));
    }
    if data[1] != S5_USER_PASS_SUCCESS {
        return Err(Error::BadProxyReply("authentication rejected"));
    }
    Ok(())
}

fn encode_socks5_connect(cmd: u8, dst: SocketAddr) -> Vec<u8> {
    let mut req = vec![SOCKS5_VERSION, cmd, 0x00];
    match dst {
        SocketAddr::V4(a) => {
            req.push(S5_ATYP_IPV4);
            req.extend_from_slice(&a.ip().octets());
        }
        SocketAddr::V6(a) => {
            req.push(S5_ATYP_IPV6);
            req.extend_from_slice(&a.ip().octets());
        }
    }
    req.extend_from_slice(&dst.port().to_be_bytes());
    req
}

/// Accumulate a fixed-size reply; anything longer is a bad proxy reply
fn take_reply(reply: &mut Vec<u8>, chunk: &mut &[u8], expected: usize) -> Result<Option<Vec<u8>>> {
    let want = expected - reply.len();
    let take = want.min(chunk.len());
    reply.extend_from_slice(&chunk[..take]);
    *chunk = &chunk[take..];
    if reply.len() < expected {
        return Ok(None);
    }
    if !chunk.is_empty() {
        // The peer pipelined bytes past the reply it owes us.
        return Err(Error::BadProxyReply("reply longer than expected"));
    }
    Ok(Some(std::mem::take(reply)))
}

/// Accumulate a CONNECT/ASSOCIATE reply whose size depends on the address type
fn take_connect_reply(reply: &mut Vec<u8>, chunk: &mut &[u8]) -> Result<Option<SocketAddr>> {
    reply.extend_from_slice(chunk);
    *chunk = &[];
    if reply.len() < 4 {
        return Ok(None);
    }
    if reply[0] != SOCKS5_VERSION {
        return Err(Error::BadProxyReply("malformed SOCKS5 version"));
    }
    if reply[1] != S5_REPLY_SUCCEEDED {
        return Err(Error::BadProxyReply("request rejected"));
    }
    let addr_len = match reply[3] {
        S5_ATYP_IPV4 => 4,
        S5_ATYP_IPV6 => 16,
        _ => return Err(Error::BadProxyReply("bad address type")),
    };
    let full_len = 4 + addr_len + 2;
    if reply.len() < full_len {
        return Ok(None);
    }
    if reply.len() > full_len {
        return Err(Error::BadProxyReply("reply longer than expected"));
    }
    let port = u16::from_be_bytes([reply[4 + addr_len], reply[5 + addr_len]]);
    let addr = match addr_len {
        4 => {
            let octets: [u8; 4] = reply[4..8].try_into().unwrap();
            SocketAddr::new(Ipv4Addr::from(octets).into(), port)
        }
        _ => {
            let octets: [u8; 16] = reply[4..20].try_into().unwrap();
            SocketAddr::new(Ipv6Addr::from(octets).into(), port)
        }
    };
    Ok(Some(addr))
}

/// SOCKS5 UDP request header: rsv(2) frag(1) atyp(1) addr port(2)
fn encode_udp_header(peer: SocketAddr) -> Vec<u8> {
    let mut header = vec![0x00, 0x00, 0x00];
    match peer {
        SocketAddr::V4(a) => {
            header.push(S5_ATYP_IPV4);
            header.extend_from_slice(&a.ip().octets());
        }
        SocketAddr::V6(a) => {
            header.push(S5_ATYP_IPV6);
            header.extend_from_slice(&a.ip().octets());
        }
    }
    header.extend_from_slice(&peer.port().to_be_bytes());
    header
}

/// Parse a relay datagram header, returning its length and the sender address
fn parse_udp_header(data: &[u8]) -> Result<(usize, SocketAddr)> {
    if data.len() < 4 {
        return Err(Error::BadProxyReply("short UDP header"));
    }
    if data[2] != 0 {
        // Fragmented relay datagrams are not supported.
        return Err(Error::BadProxyReply("fragmented UDP datagram"));
    }
    let addr_len = match data[3] {
        S5_ATYP_IPV4 => 4,
        S5_ATYP_IPV6 => 16,
        _ => return Err(Error::BadProxyReply("bad address type")),
    };
    let header_len = 4 + addr_len + 2;
    if data.len() < header_len {
        return Err(Error::BadProxyReply("short UDP header"));
    }
    let port = u16::from_be_bytes([data[4 + addr_len], data[5 + addr_len]]);
    let addr = match addr_len {
        4 => {
            let octets: [u8; 4] = data[4..8].try_into().unwrap();
            SocketAddr::new(Ipv4Addr::from(octets).into(), port)
        }
        _ => {
            let octets: [u8; 16] = data[4..20].try_into().unwrap();
            SocketAddr::new(Ipv6Addr::from(octets).into(), port)
        }
    };
    Ok((header_len, addr))
}
