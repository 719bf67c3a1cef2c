//! Plain DNS upstream: UDP with TCP retry on truncation, or TCP only

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hickory_proto::op::Message;

use sift_net::Connector;

use crate::bootstrap::Bootstrapper;
use crate::config::UpstreamOptions;
use crate::error::{DnsError, Result};
use crate::upstream::{RttEstimate, Upstream};

pub struct PlainUpstream {
    options: UpstreamOptions,
    rtt: RttEstimate,
    bootstrap: Arc<Bootstrapper>,
    connector: Connector,
    /// `tcp://` upstreams skip the UDP attempt
    prefer_tcp: bool,
}

impl PlainUpstream {
    pub fn new(
        options: UpstreamOptions,
        bootstrap: Arc<Bootstrapper>,
        connector: Connector,
        prefer_tcp: bool,
    ) -> Self {
        Self {
            options,
            rtt: RttEstimate::new(),
            bootstrap,
            connector,
            prefer_tcp,
        }
    }

    async fn exchange_udp(&self, request: &Message, encoded: &[u8]) -> Result<Message> {
        let addr = *self
            .bootstrap
            .get()
            .await?
            .first()
            .ok_or_else(|| DnsError::Bootstrap("no addresses resolved".into()))?;
        let timeout = self.options.timeout;

        let result: Result<Message> = async {
            let mut flow = self.connector.connect_udp(addr, self.options.outbound_interface.as_deref(), Some(timeout)).await?;
            flow.send_dns_packet(encoded).await?;

            // Unrelated datagrams (stale responses to earlier queries) are
            // skipped until the matching id arrives or the timeout hits.
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline
                    .checked_duration_since(Instant::now())
                    .ok_or(sift_net::Error::TimedOut)?;
                let raw = flow.receive_dns_packet(Some(remaining)).await?;
                let response =
                    Message::from_vec(&raw).map_err(|e| DnsError::Decode(e.to_string()))?;
                if response.id() == request.id() {
                    return Ok(response);
                }
            }
        }
        .await;

        if let Err(e) = &result {
            if !e.is_timeout() {
                self.bootstrap.remove_resolved(addr);
            }
        }
        result
    }

    async fn exchange_tcp(&self, request: &Message, encoded: &[u8]) -> Result<Message> {
        let addr = *self
            .bootstrap
            .get()
            .await?
            .first()
            .ok_or_else(|| DnsError::Bootstrap("no addresses resolved".into()))?;
        let timeout = self.options.timeout;

        let result: Result<Message> = async {
            let mut flow = self.connector.connect_tcp(addr, self.options.outbound_interface.as_deref(), Some(timeout)).await?;
            flow.send_dns_packet(encoded).await?;
            let raw = flow.receive_dns_packet(Some(timeout)).await?;
            let response = Message::from_vec(&raw).map_err(|e| DnsError::Decode(e.to_string()))?;
            if response.id() != request.id() {
                return Err(DnsError::Decode("response id mismatch".into()));
            }
            Ok(response)
        }
        .await;

        if let Err(e) = &result {
            if !e.is_timeout() {
                self.bootstrap.remove_resolved(addr);
            }
        }
        result
    }
}

#[async_trait]
impl Upstream for PlainUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        let encoded = request
            .to_vec()
            .map_err(|e| DnsError::Encode(e.to_string()))?;

        if self.prefer_tcp {
            return self.exchange_tcp(request, &encoded).await;
        }

        let response = self.exchange_udp(request, &encoded).await?;
        if response.truncated() {
            log::debug!(
                "[{}] response truncated, retrying over TCP",
                self.options.address
            );
            return self.exchange_tcp(request, &encoded).await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::str::FromStr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    fn make_request(name: &str) -> Message {
        let mut request = Message::new();
        request.set_id(0x77aa);
        request.set_recursion_desired(true);
        request.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        request
    }

    fn answer_for(request: &Message, truncated: bool) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_truncated(truncated);
        response.add_query(request.queries()[0].clone());
        if !truncated {
            response.add_answer(Record::from_rdata(
                request.queries()[0].name().clone(),
                60,
                RData::A(A(Ipv4Addr::new(203, 0, 113, 99))),
            ));
        }
        response
    }

    async fn spawn_udp_server(truncate: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (n, src) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let request = Message::from_vec(&buf[..n]).unwrap();
                let response = answer_for(&request, truncate);
                socket
                    .send_to(&response.to_vec().unwrap(), src)
                    .await
                    .unwrap();
            }
        });
        addr
    }

    async fn spawn_tcp_server(port_of: SocketAddr) -> SocketAddr {
        let listener = TcpListener::bind(port_of).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(c) => c,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut prefix = [0u8; 2];
                    if stream.read_exact(&mut prefix).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(prefix) as usize;
                    let mut body = vec![0u8; len];
                    stream.read_exact(&mut body).await.unwrap();
                    let request = Message::from_vec(&body).unwrap();
                    let encoded = answer_for(&request, false).to_vec().unwrap();
                    let mut framed = (encoded.len() as u16).to_be_bytes().to_vec();
                    framed.extend_from_slice(&encoded);
                    stream.write_all(&framed).await.unwrap();
                });
            }
        });
        addr
    }

    fn upstream_for(addr: SocketAddr, prefer_tcp: bool) -> PlainUpstream {
        let mut options = UpstreamOptions::new(addr.to_string(), 1);
        options.timeout = std::time::Duration::from_secs(2);
        let bootstrap = Arc::new(Bootstrapper::with_resolved("stub", vec![addr]));
        PlainUpstream::new(options, bootstrap, Connector::Direct, prefer_tcp)
    }

    #[tokio::test]
    async fn test_udp_exchange() {
        let addr = spawn_udp_server(false).await;
        let upstream = upstream_for(addr, false);
        let request = make_request("example.com.");
        let response = upstream.exchange(&request).await.unwrap();
        assert_eq!(response.id(), request.id());
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_udp_falls_back_to_tcp() {
        // UDP and TCP servers share the port; UDP truncates, TCP answers.
        let addr = spawn_udp_server(true).await;
        spawn_tcp_server(addr).await;
        let upstream = upstream_for(addr, false);
        let response = upstream.exchange(&make_request("example.com.")).await.unwrap();
        assert!(!response.truncated());
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_tcp_exchange() {
        let free = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = free.local_addr().unwrap();
        drop(free);
        let addr = spawn_tcp_server(addr).await;
        let upstream = upstream_for(addr, true);
        let response = upstream.exchange(&make_request("example.com.")).await.unwrap();
        assert_eq!(response.answers().len(), 1);
    }
}
