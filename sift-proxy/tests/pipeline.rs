//! End-to-end pipeline tests against stub UDP upstreams
//!
//! Each scenario runs a full proxy instance with its own stub resolvers, so
//! many proxies coexist in one test process without interference.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::str::FromStr;
use tokio::net::UdpSocket;

use sift_proxy::{
    DnsMessageInfo, DnsProxy, DnsProxyEvents, DnsProxySettings, DnsRequestProcessedEvent,
    FilterList, FilterParams, OutboundProxySettings, SocksProtocol, TransportProtocol,
    UpstreamOptions,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Behavior of a stub upstream resolver
#[derive(Clone)]
struct StubConfig {
    rcode: ResponseCode,
    a_answers: Vec<Ipv4Addr>,
    ttl: u32,
    delay: Duration,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            rcode: ResponseCode::NoError,
            a_answers: vec![Ipv4Addr::new(93, 184, 216, 34)],
            ttl: 30,
            delay: Duration::ZERO,
        }
    }
}

struct StubUpstream {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
}

async fn spawn_stub(config: StubConfig) -> StubUpstream {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = queries.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (n, src) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let request = match Message::from_vec(&buf[..n]) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !config.delay.is_zero() {
                tokio::time::sleep(config.delay).await;
            }

            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_recursion_available(true);
            response.set_response_code(config.rcode);
            if let Some(query) = request.queries().first() {
                response.add_query(query.clone());
                if config.rcode == ResponseCode::NoError && query.query_type() == RecordType::A {
                    for ip in &config.a_answers {
                        response.add_answer(Record::from_rdata(
                            query.name().clone(),
                            config.ttl,
                            RData::A(A(*ip)),
                        ));
                    }
                }
            }
            let _ = socket.send_to(&response.to_vec().unwrap(), src).await;
        }
    });

    StubUpstream { addr, queries }
}

type EventLog = Arc<Mutex<Vec<DnsRequestProcessedEvent>>>;

fn capture_events() -> (DnsProxyEvents, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let events = DnsProxyEvents {
        on_request_processed: Some(Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        })),
        on_certificate_verification: None,
    };
    (events, log)
}

fn base_settings(upstreams: Vec<SocketAddr>) -> DnsProxySettings {
    DnsProxySettings {
        upstreams: upstreams
            .into_iter()
            .enumerate()
            .map(|(i, addr)| {
                let mut options = UpstreamOptions::new(addr.to_string(), i as i32 + 1);
                options.timeout = Duration::from_secs(2);
                options
            })
            .collect(),
        fallback_domains: Vec::new(),
        ..DnsProxySettings::default()
    }
}

fn make_query(name: &str, rr_type: RecordType, id: u16) -> Vec<u8> {
    let mut request = Message::new();
    request.set_id(id);
    request.set_recursion_desired(true);
    request.add_query(Query::query(Name::from_str(name).unwrap(), rr_type));
    request.to_vec().unwrap()
}

fn udp_info(port: u16) -> DnsMessageInfo {
    DnsMessageInfo {
        proto: TransportProtocol::Udp,
        peer: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
    }
}

#[tokio::test]
async fn plain_udp_hit_then_cache() {
    let stub = spawn_stub(StubConfig::default()).await;
    let (events, log) = capture_events();
    let proxy = DnsProxy::init(base_settings(vec![stub.addr]), events)
        .await
        .unwrap();

    let raw = proxy
        .handle_message(&make_query("example.com.", RecordType::A, 0x1001), None)
        .await;
    let response = Message::from_vec(&raw).unwrap();
    assert_eq!(response.id(), 0x1001);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(
        *response.answers()[0].data(),
        RData::A(A(Ipv4Addr::new(93, 184, 216, 34)))
    );
    assert_eq!(stub.queries.load(Ordering::SeqCst), 1);

    // Within the TTL the second query is served from the cache and the
    // upstream is not touched again.
    let raw = proxy
        .handle_message(&make_query("example.com.", RecordType::A, 0x1002), None)
        .await;
    let cached = Message::from_vec(&raw).unwrap();
    assert_eq!(cached.id(), 0x1002);
    assert_eq!(cached.answers().len(), 1);
    assert_eq!(stub.queries.load(Ordering::SeqCst), 1);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert!(!log[0].cache_hit);
    assert!(log[1].cache_hit);
    assert_eq!(log[0].upstream_id, Some(1));
    assert_eq!(log[0].domain, "example.com.");
    assert_eq!(log[0].query_type, "A");
}

#[tokio::test]
async fn ipv6_block_answers_with_soa() {
    let stub = spawn_stub(StubConfig::default()).await;
    let (events, _log) = capture_events();
    let mut settings = base_settings(vec![stub.addr]);
    settings.block_ipv6 = true;
    let proxy = DnsProxy::init(settings, events).await.unwrap();

    let raw = proxy
        .handle_message(&make_query("example.com.", RecordType::AAAA, 0x2001), None)
        .await;
    let response = Message::from_vec(&raw).unwrap();
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 0);
    assert_eq!(response.name_servers().len(), 1);
    assert_eq!(response.name_servers()[0].record_type(), RecordType::SOA);
    assert_eq!(response.name_servers()[0].ttl(), 60);
    // The upstream was never asked.
    assert_eq!(stub.queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn mozilla_canary_gets_nxdomain() {
    let stub = spawn_stub(StubConfig::default()).await;
    let (events, _log) = capture_events();
    let proxy = DnsProxy::init(base_settings(vec![stub.addr]), events)
        .await
        .unwrap();

    let raw = proxy
        .handle_message(
            &make_query("use-application-dns.net.", RecordType::A, 0x3001),
            None,
        )
        .await;
    let response = Message::from_vec(&raw).unwrap();
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert_eq!(stub.queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn formerr_carries_transport_id() {
    let stub = spawn_stub(StubConfig::default()).await;
    let (events, _log) = capture_events();
    let proxy = DnsProxy::init(base_settings(vec![stub.addr]), events)
        .await
        .unwrap();

    let raw = proxy.handle_message(&[0xab, 0xcd, 0x00], None).await;
    let response = Message::from_vec(&raw).unwrap();
    assert_eq!(response.id(), 0xabcd);
    assert_eq!(response.response_code(), ResponseCode::FormErr);
    assert_eq!(&raw[..2], &[0xab, 0xcd]);
}

#[tokio::test]
async fn retransmission_is_suppressed_and_rerouted() {
    // Slow primary, fast fallback: the duplicate goes to the fallback and
    // only the duplicate produces a reply.
    let primary = spawn_stub(StubConfig {
        delay: Duration::from_millis(300),
        ..StubConfig::default()
    })
    .await;
    let fallback = spawn_stub(StubConfig {
        a_answers: vec![Ipv4Addr::new(198, 51, 100, 55)],
        ..StubConfig::default()
    })
    .await;

    let (events, _log) = capture_events();
    let mut settings = base_settings(vec![primary.addr]);
    settings.fallbacks = vec![{
        let mut options = UpstreamOptions::new(fallback.addr.to_string(), 100);
        options.timeout = Duration::from_secs(2);
        options
    }];
    settings.enable_retransmission_handling = true;
    let proxy = Arc::new(DnsProxy::init(settings, events).await.unwrap());

    let query = make_query("retry.example.", RecordType::A, 0x4242);
    let info = udp_info(50000);

    let first = {
        let proxy = proxy.clone();
        let query = query.clone();
        let info = info.clone();
        tokio::spawn(async move { proxy.handle_message(&query, Some(&info)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = proxy.handle_message(&query, Some(&info)).await;
    let first = first.await.unwrap();

    // Exactly one response, and it is the fallback-routed one.
    assert!(first.is_empty(), "original response must be suppressed");
    let response = Message::from_vec(&second).unwrap();
    assert_eq!(
        *response.answers()[0].data(),
        RData::A(A(Ipv4Addr::new(198, 51, 100, 55)))
    );
    assert!(fallback.queries.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn fallback_race_prefers_noerror_with_more_answers() {
    let servfail = spawn_stub(StubConfig {
        rcode: ResponseCode::ServFail,
        ..StubConfig::default()
    })
    .await;
    let good = spawn_stub(StubConfig {
        a_answers: vec![Ipv4Addr::new(203, 0, 113, 1), Ipv4Addr::new(203, 0, 113, 2)],
        ..StubConfig::default()
    })
    .await;

    let (events, _log) = capture_events();
    let mut settings = base_settings(vec![spawn_stub(StubConfig::default()).await.addr]);
    settings.fallbacks = [servfail.addr, good.addr]
        .iter()
        .enumerate()
        .map(|(i, addr)| {
            let mut options = UpstreamOptions::new(addr.to_string(), 200 + i as i32);
            options.timeout = Duration::from_secs(2);
            options
        })
        .collect();
    settings.fallback_domains = vec!["*.fallback.test".to_string()];
    let proxy = DnsProxy::init(settings, events).await.unwrap();

    let raw = proxy
        .handle_message(&make_query("a.fallback.test.", RecordType::A, 0x5001), None)
        .await;
    let response = Message::from_vec(&raw).unwrap();
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 2);
}

#[tokio::test]
async fn blocked_domain_gets_refused() {
    let stub = spawn_stub(StubConfig::default()).await;
    let (events, log) = capture_events();
    let mut settings = base_settings(vec![stub.addr]);
    settings.filter_params = FilterParams {
        filters: vec![FilterList {
            id: 7,
            data: "||blocked.example^\n".into(),
        }],
    };
    let proxy = DnsProxy::init(settings, events).await.unwrap();

    let raw = proxy
        .handle_message(&make_query("ads.blocked.example.", RecordType::A, 0x6001), None)
        .await;
    let response = Message::from_vec(&raw).unwrap();
    assert_eq!(response.response_code(), ResponseCode::Refused);
    assert_eq!(stub.queries.load(Ordering::SeqCst), 0);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].rules, vec!["||blocked.example^".to_string()]);
    assert_eq!(log[0].filter_list_ids, vec![7]);
    assert!(!log[0].whitelist);
}

#[tokio::test]
async fn exception_rule_allows_resolution() {
    let stub = spawn_stub(StubConfig::default()).await;
    let (events, log) = capture_events();
    let mut settings = base_settings(vec![stub.addr]);
    settings.filter_params = FilterParams {
        filters: vec![FilterList {
            id: 7,
            data: "||example.org^\n@@||good.example.org^\n".into(),
        }],
    };
    let proxy = DnsProxy::init(settings, events).await.unwrap();

    let raw = proxy
        .handle_message(&make_query("good.example.org.", RecordType::A, 0x6002), None)
        .await;
    let response = Message::from_vec(&raw).unwrap();
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert_eq!(stub.queries.load(Ordering::SeqCst), 1);
    assert!(log.lock().unwrap()[0].whitelist);
}

#[tokio::test]
async fn dnsrewrite_synthesizes_address() {
    let stub = spawn_stub(StubConfig::default()).await;
    let (events, _log) = capture_events();
    let mut settings = base_settings(vec![stub.addr]);
    settings.filter_params = FilterParams {
        filters: vec![FilterList {
            id: 1,
            data: "||rw.example^$dnsrewrite=10.20.30.40\n".into(),
        }],
    };
    let proxy = DnsProxy::init(settings, events).await.unwrap();

    let raw = proxy
        .handle_message(&make_query("rw.example.", RecordType::A, 0x6003), None)
        .await;
    let response = Message::from_vec(&raw).unwrap();
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(
        *response.answers()[0].data(),
        RData::A(A(Ipv4Addr::new(10, 20, 30, 40)))
    );
    assert_eq!(stub.queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upstream_failure_without_servfail_is_silent() {
    // An unreachable upstream: nothing listens on the port.
    let unused = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let (events, _log) = capture_events();
    let mut settings = base_settings(vec![dead_addr]);
    settings.upstreams[0].timeout = Duration::from_millis(200);
    let proxy = DnsProxy::init(settings, events).await.unwrap();

    let raw = proxy
        .handle_message(&make_query("example.com.", RecordType::A, 0x7001), None)
        .await;
    assert!(raw.is_empty());
}

#[tokio::test]
async fn upstream_failure_with_servfail_synthesizes() {
    let unused = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let (events, log) = capture_events();
    let mut settings = base_settings(vec![dead_addr]);
    settings.upstreams[0].timeout = Duration::from_millis(200);
    settings.enable_servfail_on_upstreams_failure = true;
    let proxy = DnsProxy::init(settings, events).await.unwrap();

    let raw = proxy
        .handle_message(&make_query("example.com.", RecordType::A, 0x7002), None)
        .await;
    let response = Message::from_vec(&raw).unwrap();
    assert_eq!(response.response_code(), ResponseCode::ServFail);
    assert!(!log.lock().unwrap()[0].error.is_empty());
}

#[tokio::test]
async fn oversized_udp_response_is_truncated() {
    let stub = spawn_stub(StubConfig {
        a_answers: (0..120).map(|i| Ipv4Addr::new(10, 0, (i / 250) as u8, (i % 250) as u8)).collect(),
        ..StubConfig::default()
    })
    .await;
    let (events, _log) = capture_events();
    let proxy = DnsProxy::init(base_settings(vec![stub.addr]), events)
        .await
        .unwrap();

    let info = udp_info(51000);
    let raw = proxy
        .handle_message(&make_query("big.example.", RecordType::A, 0x8001), Some(&info))
        .await;
    assert!(raw.len() <= 512, "UDP response must fit 512 bytes, got {}", raw.len());
    let response = Message::from_vec(&raw).unwrap();
    assert!(response.truncated());
}

/// Minimal SOCKS5 server with a working UDP relay, counting associations
async fn spawn_socks5_udp_proxy() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let associates = Arc::new(AtomicUsize::new(0));
    let counter = associates.clone();

    tokio::spawn(async move {
        loop {
            let (mut control, _) = match listener.accept().await {
                Ok(c) => c,
                Err(_) => return,
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut head = [0u8; 2];
                control.read_exact(&mut head).await.unwrap();
                let mut methods = vec![0u8; head[1] as usize];
                control.read_exact(&mut methods).await.unwrap();
                control.write_all(&[0x05, 0x00]).await.unwrap();

                let mut request = [0u8; 10];
                control.read_exact(&mut request).await.unwrap();
                assert_eq!(request[1], 0x03, "expected UDP ASSOCIATE");
                counter.fetch_add(1, Ordering::SeqCst);

                let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                let relay_addr = relay.local_addr().unwrap();
                let mut reply = vec![0x05, 0x00, 0x00, 0x01];
                match relay_addr.ip() {
                    std::net::IpAddr::V4(ip) => reply.extend_from_slice(&ip.octets()),
                    _ => unreachable!(),
                }
                reply.extend_from_slice(&relay_addr.port().to_be_bytes());
                control.write_all(&reply).await.unwrap();

                // Relay datagrams: strip the request header, forward to the
                // target, wrap the answer in the same header.
                let relay_task = tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    loop {
                        let (n, client) = match relay.recv_from(&mut buf).await {
                            Ok(r) => r,
                            Err(_) => return,
                        };
                        if n < 10 || buf[3] != 0x01 {
                            continue;
                        }
                        let header: [u8; 10] = buf[..10].try_into().unwrap();
                        let target = SocketAddr::from((
                            Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
                            u16::from_be_bytes([buf[8], buf[9]]),
                        ));
                        let out = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                        out.send_to(&buf[10..n], target).await.unwrap();
                        let mut answer = [0u8; 2048];
                        let Ok(Ok((m, _))) = tokio::time::timeout(
                            Duration::from_secs(1),
                            out.recv_from(&mut answer),
                        )
                        .await
                        else {
                            continue;
                        };
                        let mut packet = header.to_vec();
                        packet.extend_from_slice(&answer[..m]);
                        relay.send_to(&packet, client).await.unwrap();
                    }
                });

                let mut sink = [0u8; 64];
                while matches!(control.read(&mut sink).await, Ok(n) if n > 0) {}
                relay_task.abort();
            });
        }
    });

    (addr, associates)
}

#[tokio::test]
async fn socks5_udp_queries_share_one_association() {
    // The stub is slow enough that both queries hold their UDP flows open
    // at the same time.
    let stub = spawn_stub(StubConfig {
        delay: Duration::from_millis(100),
        ..StubConfig::default()
    })
    .await;
    let (proxy_addr, associates) = spawn_socks5_udp_proxy().await;

    let mut settings = base_settings(vec![stub.addr]);
    settings.outbound_proxy = Some(OutboundProxySettings {
        protocol: SocksProtocol::Socks5Udp,
        address: proxy_addr,
        auth: None,
    });
    let proxy = Arc::new(DnsProxy::init(settings, DnsProxyEvents::default()).await.unwrap());

    let query_a = make_query("one.example.", RecordType::A, 1);
    let query_b = make_query("two.example.", RecordType::A, 2);
    let (raw_a, raw_b) = tokio::join!(
        proxy.handle_message(&query_a, None),
        proxy.handle_message(&query_b, None)
    );
    let response_a = Message::from_vec(&raw_a).unwrap();
    let response_b = Message::from_vec(&raw_b).unwrap();
    assert_eq!(response_a.answers().len(), 1);
    assert_eq!(response_b.answers().len(), 1);
    assert_eq!(associates.load(Ordering::SeqCst), 1);
    // Both flows are closed; everything went through the proxy.
    assert_eq!(stub.queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn optimistic_cache_serves_expired_and_refreshes() {
    let stub = spawn_stub(StubConfig {
        ttl: 1,
        ..StubConfig::default()
    })
    .await;
    let (events, log) = capture_events();
    let settings = base_settings(vec![stub.addr]);
    assert!(settings.optimistic_cache);
    let proxy = DnsProxy::init(settings, events).await.unwrap();

    let query = make_query("stale.example.", RecordType::A, 0x9001);
    let raw = proxy.handle_message(&query, None).await;
    assert!(!raw.is_empty());
    assert_eq!(stub.queries.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // The expired entry is served immediately...
    let raw = proxy.handle_message(&query, None).await;
    assert!(!raw.is_empty());
    assert!(log.lock().unwrap().last().unwrap().cache_hit);

    // ...and a background refresh hits the upstream shortly after.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stub.queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn many_proxies_coexist() {
    // No process-global state: instances resolve independently.
    let stub_a = spawn_stub(StubConfig {
        a_answers: vec![Ipv4Addr::new(10, 1, 1, 1)],
        ..StubConfig::default()
    })
    .await;
    let stub_b = spawn_stub(StubConfig {
        a_answers: vec![Ipv4Addr::new(10, 2, 2, 2)],
        ..StubConfig::default()
    })
    .await;

    let proxy_a = DnsProxy::init(base_settings(vec![stub_a.addr]), DnsProxyEvents::default())
        .await
        .unwrap();
    let proxy_b = DnsProxy::init(base_settings(vec![stub_b.addr]), DnsProxyEvents::default())
        .await
        .unwrap();

    let query_a = make_query("same.example.", RecordType::A, 1);
    let query_b = make_query("same.example.", RecordType::A, 1);
    let (raw_a, raw_b) = tokio::join!(
        proxy_a.handle_message(&query_a, None),
        proxy_b.handle_message(&query_b, None)
    );
    let response_a = Message::from_vec(&raw_a).unwrap();
    let response_b = Message::from_vec(&raw_b).unwrap();
    assert_eq!(*response_a.answers()[0].data(), RData::A(A(Ipv4Addr::new(10, 1, 1, 1))));
    assert_eq!(*response_b.answers()[0].data(), RData::A(A(Ipv4Addr::new(10, 2, 2, 2))));

    proxy_a.deinit();
    // A deinitialized proxy stops replying; the other keeps working.
    let raw = proxy_a
        .handle_message(&make_query("same.example.", RecordType::A, 2), None)
        .await;
    assert!(raw.is_empty());
    let raw = proxy_b
        .handle_message(&make_query("same.example.", RecordType::A, 2), None)
        .await;
    assert!(!raw.is_empty());
}
