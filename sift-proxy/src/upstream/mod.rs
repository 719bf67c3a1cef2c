//! Upstream resolvers over the supported transports
//!
//! Every upstream exposes the same narrow surface: exchange a message,
//! report its options, and keep a running RTT estimate the load balancer
//! feeds on. Concrete transports: plain UDP/TCP, DoT, DoH (HTTP/2 with an
//! optional HTTP/3 race, or HTTP/3 only), DoQ, DNSCrypt.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sift_net::{with_timeout as net_timeout, Connector};

use crate::bootstrap::Bootstrapper;
use crate::config::{
    parse_upstream_address, OutboundProxySettings, UpstreamOptions, UpstreamScheme,
};
use crate::error::{DnsError, Result};
use crate::upstream::dnscrypt::DnsCryptUpstream;
use crate::upstream::https::DohUpstream;
use crate::upstream::plain::PlainUpstream;
use crate::upstream::quic::DoqUpstream;
use crate::upstream::tls::DotUpstream;

pub mod dnscrypt;
pub mod https;
pub mod plain;
pub mod quic;
pub mod tls;

/// A single resolver endpoint with its transport state
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` and wait for the response
    async fn exchange(&self, request: &Message) -> Result<Message>;

    fn options(&self) -> &UpstreamOptions;

    /// Latest RTT estimate; `None` until the first attempt
    fn rtt_estimate(&self) -> Option<Duration>;

    /// Record the outcome of an attempt (measured time, or the penalty value
    /// on failure)
    fn update_rtt(&self, rtt: Duration);
}

/// Monotonically updated RTT estimate shared by all transports
#[derive(Debug, Default)]
pub struct RttEstimate(Mutex<Option<Duration>>);

impl RttEstimate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Duration> {
        *self.0.lock().unwrap()
    }

    pub fn update(&self, rtt: Duration) {
        *self.0.lock().unwrap() = Some(rtt);
    }
}

/// Shared pieces handed to every created upstream
#[derive(Clone)]
pub struct UpstreamFactoryConfig {
    pub connector: Connector,
    pub tls_config: Arc<rustls::ClientConfig>,
    pub outbound_proxy: Option<OutboundProxySettings>,
    pub ipv6_available: bool,
    pub enable_http3: bool,
}

/// Creates upstream instances from their options
pub struct UpstreamFactory {
    config: UpstreamFactoryConfig,
}

impl UpstreamFactory {
    pub fn new(config: UpstreamFactoryConfig) -> Self {
        Self { config }
    }

    pub fn create_upstream(&self, options: UpstreamOptions) -> Result<Arc<dyn Upstream>> {
        let parsed = parse_upstream_address(&options.address)
            .map_err(|_| DnsError::Internal(format!("unparseable upstream address {}", options.address)))?;

        // Fallback upstreams dial around the outbound proxy.
        let connector = if options.ignore_proxy {
            Connector::Direct
        } else {
            self.config.connector.clone()
        };
        let proxy = if options.ignore_proxy {
            None
        } else {
            self.config.outbound_proxy.clone()
        };

        if parsed.scheme != UpstreamScheme::DnsCrypt
            && !parsed.host_is_literal()
            && options.bootstrap.is_empty()
            && options.resolved_addrs.is_empty()
        {
            return Err(DnsError::Bootstrap(format!(
                "upstream {} needs a bootstrap resolver or pre-resolved addresses",
                options.address
            )));
        }

        let bootstrap = Arc::new(if !options.resolved_addrs.is_empty() {
            Bootstrapper::with_resolved(&parsed.host, options.resolved_addrs.clone())
        } else {
            Bootstrapper::new(
                &parsed.host,
                parsed.port,
                &options.bootstrap,
                options.timeout,
                self.config.ipv6_available,
            )
        });

        let upstream: Arc<dyn Upstream> = match parsed.scheme {
            UpstreamScheme::Udp => {
                Arc::new(PlainUpstream::new(options, bootstrap, connector, false))
            }
            UpstreamScheme::Tcp => {
                Arc::new(PlainUpstream::new(options, bootstrap, connector, true))
            }
            UpstreamScheme::Tls => Arc::new(DotUpstream::new(
                options,
                parsed,
                bootstrap,
                connector,
                self.config.tls_config.clone(),
            )?),
            UpstreamScheme::Https => Arc::new(DohUpstream::new(
                options,
                parsed,
                bootstrap,
                self.config.tls_config.clone(),
                proxy,
                self.config.enable_http3,
                false,
            )?),
            UpstreamScheme::H3 => Arc::new(DohUpstream::new(
                options,
                parsed,
                bootstrap,
                self.config.tls_config.clone(),
                proxy,
                true,
                true,
            )?),
            UpstreamScheme::Quic => Arc::new(DoqUpstream::new(
                options,
                parsed,
                bootstrap,
                self.config.tls_config.clone(),
            )?),
            UpstreamScheme::DnsCrypt => {
                Arc::new(DnsCryptUpstream::new(options, connector)?)
            }
        };
        Ok(upstream)
    }
}

fn map_stream_io(e: std::io::Error) -> DnsError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        DnsError::Transport(sift_net::Error::ConnectionClosed)
    } else {
        DnsError::Transport(sift_net::Error::Io(e))
    }
}

/// Framed DNS exchange over any byte stream (TLS, tunneled TCP)
pub(crate) async fn exchange_framed<S>(
    stream: &mut S,
    request: &Message,
    timeout: Duration,
) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let encoded = request.to_vec().map_err(|e| DnsError::Encode(e.to_string()))?;
    let mut framed = Vec::with_capacity(2 + encoded.len());
    framed.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
    framed.extend_from_slice(&encoded);

    let raw = net_timeout(Some(timeout), async {
        stream.write_all(&framed).await.map_err(map_io_to_net)?;
        let mut prefix = [0u8; 2];
        stream.read_exact(&mut prefix).await.map_err(map_io_to_net)?;
        let len = u16::from_be_bytes(prefix) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.map_err(map_io_to_net)?;
        Ok(body)
    })
    .await?;

    let response = Message::from_vec(&raw).map_err(|e| DnsError::Decode(e.to_string()))?;
    if response.id() != request.id() {
        return Err(DnsError::Decode("response id mismatch".into()));
    }
    Ok(response)
}

fn map_io_to_net(e: std::io::Error) -> sift_net::Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        sift_net::Error::ConnectionClosed
    } else {
        sift_net::Error::Io(e)
    }
}

/// Dial a QUIC connection with the given ALPN; the endpoint must outlive the
/// connection and is returned alongside it
pub(crate) async fn quic_connect(
    addr: SocketAddr,
    server_name: &str,
    tls_config: &rustls::ClientConfig,
    alpn: &[u8],
    timeout: Duration,
) -> Result<(quinn::Endpoint, quinn::Connection)> {
    let mut tls = tls_config.clone();
    tls.alpn_protocols = vec![alpn.to_vec()];
    let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| DnsError::Quic(e.to_string()))?;
    let client_config = quinn::ClientConfig::new(Arc::new(quic_tls));

    let local: SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let mut endpoint = quinn::Endpoint::client(local).map_err(|e| DnsError::Quic(e.to_string()))?;
    endpoint.set_default_client_config(client_config);

    let connecting = endpoint
        .connect(addr, server_name)
        .map_err(|e| DnsError::Quic(e.to_string()))?;
    let connection = net_timeout(Some(timeout), async {
        connecting
            .await
            .map_err(|e| sift_net::Error::Io(std::io::Error::other(e)))
    })
    .await
    .map_err(|e| match e {
        sift_net::Error::TimedOut => DnsError::Transport(sift_net::Error::TimedOut),
        other => DnsError::Quic(other.to_string()),
    })?;
    Ok((endpoint, connection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DnsProxyEvents;

    fn factory() -> UpstreamFactory {
        UpstreamFactory::new(UpstreamFactoryConfig {
            connector: Connector::Direct,
            tls_config: Arc::new(crate::verify::build_tls_config(&DnsProxyEvents::default()).unwrap()),
            outbound_proxy: None,
            ipv6_available: true,
            enable_http3: false,
        })
    }

    #[test]
    fn test_create_plain_upstream() {
        let upstream = factory()
            .create_upstream(UpstreamOptions::new("8.8.8.8:53", 1))
            .unwrap();
        assert_eq!(upstream.options().id, 1);
        assert!(upstream.rtt_estimate().is_none());
    }

    #[test]
    fn test_create_tls_upstream_with_bootstrap() {
        let mut options = UpstreamOptions::new("tls://dns.example.org", 2);
        options.bootstrap = vec!["8.8.8.8".into()];
        factory().create_upstream(options).unwrap();
    }

    #[test]
    fn test_hostname_without_bootstrap_is_rejected() {
        let options = UpstreamOptions::new("tls://dns.example.org", 3);
        assert!(factory().create_upstream(options).is_err());
    }

    #[test]
    fn test_hostname_with_resolved_addrs_is_accepted() {
        let mut options = UpstreamOptions::new("tls://dns.example.org", 4);
        options.resolved_addrs = vec!["198.51.100.3:853".parse().unwrap()];
        factory().create_upstream(options).unwrap();
    }

    #[test]
    fn test_rtt_estimate_updates() {
        let rtt = RttEstimate::new();
        assert!(rtt.get().is_none());
        rtt.update(Duration::from_millis(12));
        assert_eq!(rtt.get(), Some(Duration::from_millis(12)));
        rtt.update(Duration::from_millis(90));
        assert_eq!(rtt.get(), Some(Duration::from_millis(90)));
    }
}
