//! DNS-over-QUIC upstream (RFC 9250)
//!
//! One QUIC connection is kept per upstream; every query runs on its own
//! bidirectional stream with the 2-byte length prefix and message id 0.

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;

use sift_net::with_timeout;

use crate::bootstrap::Bootstrapper;
use crate::config::{ParsedAddress, UpstreamOptions};
use crate::error::{DnsError, Result};
use crate::upstream::{quic_connect, RttEstimate, Upstream};

const DOQ_ALPN: &[u8] = b"doq";

/// Upper bound on a framed DoQ response
const MAX_RESPONSE_SIZE: usize = 65535 + 2;

pub struct DoqUpstream {
    options: UpstreamOptions,
    rtt: RttEstimate,
    bootstrap: Arc<Bootstrapper>,
    tls_config: Arc<rustls::ClientConfig>,
    server_name: String,
    connection: tokio::sync::Mutex<Option<(quinn::Endpoint, quinn::Connection)>>,
}

impl DoqUpstream {
    pub fn new(
        options: UpstreamOptions,
        parsed: ParsedAddress,
        bootstrap: Arc<Bootstrapper>,
        tls_config: Arc<rustls::ClientConfig>,
    ) -> Result<Self> {
        Ok(Self {
            options,
            rtt: RttEstimate::new(),
            bootstrap,
            tls_config,
            server_name: parsed.host,
            connection: tokio::sync::Mutex::new(None),
        })
    }

    async fn ensure_connection(&self) -> Result<quinn::Connection> {
        let mut slot = self.connection.lock().await;
        if let Some((_, connection)) = slot.as_ref() {
            if connection.close_reason().is_none() {
                return Ok(connection.clone());
            }
            *slot = None;
        }

        let addr = *self
            .bootstrap
            .get()
            .await?
            .first()
            .ok_or_else(|| DnsError::Bootstrap("no addresses resolved".into()))?;
        let result = quic_connect(
            addr,
            &self.server_name,
            &self.tls_config,
            DOQ_ALPN,
            self.options.timeout,
        )
        .await;
        match result {
            Ok((endpoint, connection)) => {
                let cloned = connection.clone();
                *slot = Some((endpoint, connection));
                Ok(cloned)
            }
            Err(e) => {
                self.bootstrap.remove_resolved(addr);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Upstream for DoqUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        let connection = self.ensure_connection().await?;

        // RFC 9250 requires id 0 on the wire.
        let mut wire_request = request.clone();
        wire_request.set_id(0);
        let encoded = wire_request
            .to_vec()
            .map_err(|e| DnsError::Encode(e.to_string()))?;
        let mut framed = Vec::with_capacity(2 + encoded.len());
        framed.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        framed.extend_from_slice(&encoded);

        let raw = with_timeout(Some(self.options.timeout), async {
            let quic_err = |e: String| sift_net::Error::Io(std::io::Error::other(e));
            let (mut send, mut recv) = connection
                .open_bi()
                .await
                .map_err(|e| quic_err(e.to_string()))?;
            send.write_all(&framed)
                .await
                .map_err(|e| quic_err(e.to_string()))?;
            send.finish().map_err(|e| quic_err(e.to_string()))?;
            recv.read_to_end(MAX_RESPONSE_SIZE)
                .await
                .map_err(|e| quic_err(e.to_string()))
        })
        .await;

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                // Whatever went wrong, the connection is suspect.
                *self.connection.lock().await = None;
                return Err(match e {
                    sift_net::Error::TimedOut => DnsError::Transport(sift_net::Error::TimedOut),
                    other => DnsError::Quic(other.to_string()),
                });
            }
        };

        if raw.len() < 2 {
            return Err(DnsError::Decode("short DoQ response".into()));
        }
        let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        if raw.len() < 2 + len {
            return Err(DnsError::Decode("truncated DoQ response".into()));
        }
        let mut response =
            Message::from_vec(&raw[2..2 + len]).map_err(|e| DnsError::Decode(e.to_string()))?;
        response.set_id(request.id());
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
