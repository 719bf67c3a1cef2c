//! DNS-over-TLS upstream with connection reuse

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls_pki_types::ServerName;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use sift_net::{with_timeout, Connector, TcpFlow};

use crate::bootstrap::Bootstrapper;
use crate::config::{ParsedAddress, UpstreamOptions};
use crate::error::{DnsError, Result};
use crate::upstream::{exchange_framed, RttEstimate, Upstream};

/// Idle connections kept for reuse
const POOL_LIMIT: usize = 8;

pub struct DotUpstream {
    options: UpstreamOptions,
    rtt: RttEstimate,
    bootstrap: Arc<Bootstrapper>,
    connector: Connector,
    tls_connector: TlsConnector,
    server_name: ServerName<'static>,
    pool: tokio::sync::Mutex<Vec<TlsStream<TcpFlow>>>,
}

impl DotUpstream {
    pub fn new(
        options: UpstreamOptions,
        parsed: ParsedAddress,
        bootstrap: Arc<Bootstrapper>,
        connector: Connector,
        tls_config: Arc<rustls::ClientConfig>,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(parsed.host.clone())
            .map_err(|e| DnsError::Tls(format!("invalid server name {}: {}", parsed.host, e)))?;
        Ok(Self {
            options,
            rtt: RttEstimate::new(),
            bootstrap,
            connector,
            tls_connector: TlsConnector::from(tls_config),
            server_name,
            pool: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    async fn connect(&self) -> Result<TlsStream<TcpFlow>> {
        let timeout = self.options.timeout;
        let addr = *self
            .bootstrap
            .get()
            .await?
            .first()
            .ok_or_else(|| DnsError::Bootstrap("no addresses resolved".into()))?;

        let result: Result<TlsStream<TcpFlow>> = async {
            let flow = self.connector.connect_tcp(addr, self.options.outbound_interface.as_deref(), Some(timeout)).await?;
            let stream = with_timeout(Some(timeout), async {
                self.tls_connector
                    .connect(self.server_name.clone(), flow)
                    .await
                    .map_err(sift_net::Error::Io)
            })
            .await
            .map_err(|e| match e {
                sift_net::Error::TimedOut => DnsError::Transport(sift_net::Error::TimedOut),
                other => DnsError::Tls(other.to_string()),
            })?;
            Ok(stream)
        }
        .await;

        if result.is_err() {
            self.bootstrap.remove_resolved(addr);
        }
        result
    }
}

#[async_trait]
impl Upstream for DotUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        // A pooled connection may have been closed by the server while idle;
        // that attempt fails fast and a fresh connection takes over.
        let pooled = self.pool.lock().await.pop();
        if let Some(mut stream) = pooled {
            match exchange_framed(&mut stream, request, self.options.timeout).await {
                Ok(response) => {
                    let mut pool = self.pool.lock().await;
                    if pool.len() < POOL_LIMIT {
                        pool.push(stream);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    log::debug!(
                        "[{}] pooled connection failed ({}), reconnecting",
                        self.options.address,
                        e
                    );
                }
            }
        }

        let mut stream = self.connect().await?;
        let response = exchange_framed(&mut stream, request, self.options.timeout).await?;
        let mut pool = self.pool.lock().await;
        if pool.len() < POOL_LIMIT {
            pool.push(stream);
        }
        Ok(response)
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
