//! DNS-over-HTTPS upstream
//!
//! HTTP/1.1 and HTTP/2 requests go through a shared HTTP client; `h3://`
//! upstreams speak HTTP/3 over QUIC exclusively. When HTTP/3 is enabled for
//! an `https://` upstream both protocols race and the first usable answer
//! wins.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use hickory_proto::op::Message;

use sift_net::with_timeout;

use crate::bootstrap::Bootstrapper;
use crate::config::{OutboundProxySettings, ParsedAddress, SocksProtocol, UpstreamOptions};
use crate::error::{DnsError, Result};
use crate::upstream::{quic_connect, RttEstimate, Upstream};

const DOH_MIME: &str = "application/dns-message";
const H3_ALPN: &[u8] = b"h3";

type H3SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

struct H3Conn {
    // The endpoint must stay alive for the connection to survive.
    _endpoint: quinn::Endpoint,
    send_request: H3SendRequest,
}

pub struct DohUpstream {
    options: UpstreamOptions,
    rtt: RttEstimate,
    bootstrap: Arc<Bootstrapper>,
    url: String,
    host: String,
    port: u16,
    tls_config: Arc<rustls::ClientConfig>,
    proxy: Option<OutboundProxySettings>,
    /// HTTP/1.1-or-2 client, built lazily after bootstrap resolution
    client: tokio::sync::Mutex<Option<reqwest::Client>>,
    /// Cached HTTP/3 connection state
    h3: tokio::sync::Mutex<Option<H3Conn>>,
    race_h3: bool,
    h3_only: bool,
}

impl DohUpstream {
    pub fn new(
        options: UpstreamOptions,
        parsed: ParsedAddress,
        bootstrap: Arc<Bootstrapper>,
        tls_config: Arc<rustls::ClientConfig>,
        proxy: Option<OutboundProxySettings>,
        enable_http3: bool,
        h3_only: bool,
    ) -> Result<Self> {
        let url = format!("https://{}:{}{}", parsed.host, parsed.port, parsed.path);
        Ok(Self {
            options,
            rtt: RttEstimate::new(),
            bootstrap,
            url,
            host: parsed.host,
            port: parsed.port,
            tls_config,
            proxy,
            client: tokio::sync::Mutex::new(None),
            h3: tokio::sync::Mutex::new(None),
            race_h3: enable_http3 && !h3_only,
            h3_only,
        })
    }

    async fn server_addr(&self) -> Result<SocketAddr> {
        let addrs = self.bootstrap.get().await?;
        addrs
            .first()
            .copied()
            .map(|addr| SocketAddr::new(addr.ip(), self.port))
            .ok_or_else(|| DnsError::Bootstrap("no addresses resolved".into()))
    }

    async fn ensure_client(&self) -> Result<reqwest::Client> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls((*self.tls_config).clone())
            .timeout(self.options.timeout);

        if self.host.parse::<std::net::IpAddr>().is_err() {
            let addr = self.server_addr().await?;
            builder = builder.resolve(&self.host, addr);
        }

        if let Some(proxy) = &self.proxy {
            let scheme = match proxy.protocol {
                SocksProtocol::Socks4 => "socks4",
                SocksProtocol::Socks5 | SocksProtocol::Socks5Udp => "socks5h",
            };
            let mut http_proxy =
                reqwest::Proxy::all(format!("{}://{}", scheme, proxy.address))
                    .map_err(|e| DnsError::Http(e.to_string()))?;
            if let Some(auth) = &proxy.auth {
                http_proxy = http_proxy.basic_auth(&auth.username, &auth.password);
            }
            builder = builder.proxy(http_proxy);
        }

        let client = builder
            .build()
            .map_err(|e| DnsError::Http(e.to_string()))?;
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn exchange_h2(&self, request: &Message) -> Result<Message> {
        let client = self.ensure_client().await?;
        // The id is zeroed on the wire so intermediaries can cache.
        let mut wire_request = request.clone();
        wire_request.set_id(0);
        let body = wire_request
            .to_vec()
            .map_err(|e| DnsError::Encode(e.to_string()))?;

        let response = client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, DOH_MIME)
            .header(reqwest::header::ACCEPT, DOH_MIME)
            .body(body)
            .send()
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DnsError::Http(format!(
                "server returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;
        let mut parsed =
            Message::from_vec(&bytes).map_err(|e| DnsError::Decode(e.to_string()))?;
        parsed.set_id(request.id());
        Ok(parsed)
    }

    async fn ensure_h3(&self) -> Result<H3SendRequest> {
        let mut slot = self.h3.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.send_request.clone());
        }

        let addr = self.server_addr().await?;
        let (endpoint, connection) = quic_connect(
            addr,
            &self.host,
            &self.tls_config,
            H3_ALPN,
            self.options.timeout,
        )
        .await?;

        let quinn_conn = h3_quinn::Connection::new(connection);
        let (mut driver, send_request) = h3::client::new(quinn_conn)
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;
        // The driver owns the connection lifecycle; it runs until the peer
        // or the send side goes away.
        tokio::spawn(async move {
            let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        *slot = Some(H3Conn {
            _endpoint: endpoint,
            send_request: send_request.clone(),
        });
        Ok(send_request)
    }

    async fn exchange_h3(&self, request: &Message) -> Result<Message> {
        let result = self.exchange_h3_inner(request).await;
        if result.is_err() {
            // The cached connection is suspect; the next attempt redials.
            *self.h3.lock().await = None;
        }
        result
    }

    async fn exchange_h3_inner(&self, request: &Message) -> Result<Message> {
        let mut send_request = self.ensure_h3().await?;

        let mut wire_request = request.clone();
        wire_request.set_id(0);
        let body = wire_request
            .to_vec()
            .map_err(|e| DnsError::Encode(e.to_string()))?;

        let http_request = http::Request::builder()
            .method(http::Method::POST)
            .uri(&self.url)
            .header(http::header::CONTENT_TYPE, DOH_MIME)
            .header(http::header::ACCEPT, DOH_MIME)
            .body(())
            .map_err(|e| DnsError::Http(e.to_string()))?;

        let raw = with_timeout(Some(self.options.timeout), async {
            let mut stream = send_request
                .send_request(http_request)
                .await
                .map_err(|e| sift_net::Error::Io(std::io::Error::other(e)))?;
            stream
                .send_data(Bytes::from(body))
                .await
                .map_err(|e| sift_net::Error::Io(std::io::Error::other(e)))?;
            stream
                .finish()
                .await
                .map_err(|e| sift_net::Error::Io(std::io::Error::other(e)))?;

            let response = stream
                .recv_response()
                .await
                .map_err(|e| sift_net::Error::Io(std::io::Error::other(e)))?;
            if !response.status().is_success() {
                return Err(sift_net::Error::Io(std::io::Error::other(format!(
                    "server returned {}",
                    response.status()
                ))));
            }
            let mut raw = Vec::new();
            while let Some(mut chunk) = stream
                .recv_data()
                .await
                .map_err(|e| sift_net::Error::Io(std::io::Error::other(e)))?
            {
                while chunk.has_remaining() {
                    let piece = chunk.chunk();
                    raw.extend_from_slice(piece);
                    let advanced = piece.len();
                    chunk.advance(advanced);
                }
            }
            Ok(raw)
        })
        .await
        .map_err(|e| match e {
            sift_net::Error::TimedOut => DnsError::Transport(sift_net::Error::TimedOut),
            other => DnsError::Http(other.to_string()),
        })?;

        let mut parsed = Message::from_vec(&raw).map_err(|e| DnsError::Decode(e.to_string()))?;
        parsed.set_id(request.id());
        Ok(parsed)
    }

    /// Race HTTP/2 against HTTP/3; first usable response wins
    async fn exchange_race(&self, request: &Message) -> Result<Message> {
        let h2 = self.exchange_h2(request);
        let h3 = self.exchange_h3(request);
        tokio::pin!(h2);
        tokio::pin!(h3);

        let mut h2_error = None;
        let mut h3_error = None;
        loop {
            tokio::select! {
                result = &mut h2, if h2_error.is_none() => match result {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        if h3_error.is_some() {
                            return Err(e);
                        }
                        h2_error = Some(e);
                    }
                },
                result = &mut h3, if h3_error.is_none() => match result {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        if let Some(h2_e) = h2_error.take() {
                            return Err(h2_e);
                        }
                        h3_error = Some(e);
                    }
                },
            }
        }
    }
}

#[async_trait]
impl Upstream for DohUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        if self.h3_only {
            self.exchange_h3(request).await
        } else if self.race_h3 {
            self.exchange_race(request).await
        } else {
            self.exchange_h2(request).await
        }
    }

    fn options(&self) -> &UpstreamOptions {
        &self.options
    }

    fn rtt_estimate(&self) -> Option<std::time::Duration> {
        self.rtt.get()
    }

    fn update_rtt(&self, rtt: std::time::Duration) {
        self.rtt.update(rtt);
    }
}
