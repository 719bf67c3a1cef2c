//! Bootstrap resolution of upstream hostnames
//!
//! Encrypted upstreams are usually configured by hostname; the bootstrapper
//! resolves those names through plain resolvers before the upstream can
//! connect. Each resolver gets half of the remaining time budget per try and
//! is rotated to the back of the list when it fails. Repeated failures
//! short-circuit further attempts for a cool-off window.

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use sift_net::AioSocket;

use crate::error::{DnsError, Result};

/// Keep retrying a failing server for this long before disabling it
const RESOLVE_TRYING_INTERVAL: Duration = Duration::from_secs(7);

/// How long a repeatedly failing server stays disabled
const TEMPORARY_DISABLE_INTERVAL: Duration = Duration::from_secs(7);

/// Smallest per-try budget
const MIN_TRY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct FailTimes {
    /// First failure of the current streak
    first: Option<Instant>,
    /// Most recent failure
    last: Option<Instant>,
}

/// Resolves one upstream hostname through a list of plain resolvers
#[derive(Debug)]
pub struct Bootstrapper {
    server_name: String,
    server_port: u16,
    timeout: Duration,
    ipv6_available: bool,
    resolvers: Mutex<Vec<SocketAddr>>,
    resolved_cache: Mutex<Vec<SocketAddr>>,
    fail_times: Mutex<FailTimes>,
}

impl Bootstrapper {
    /// Create a bootstrapper for `host:port` using `bootstrap` resolver
    /// addresses (port 53 assumed when absent)
    pub fn new(
        host: &str,
        port: u16,
        bootstrap: &[String],
        timeout: Duration,
        ipv6_available: bool,
    ) -> Self {
        let resolvers = bootstrap
            .iter()
            .filter_map(|server| parse_resolver_addr(server))
            .filter(|addr| ipv6_available || addr.is_ipv4())
            .collect::<Vec<_>>();
        if resolvers.is_empty() && host.parse::<IpAddr>().is_err() {
            log::warn!("[{}] got empty or invalid list of servers for bootstrapping", host);
        }
        Self {
            server_name: host.to_string(),
            server_port: port,
            timeout,
            ipv6_available,
            resolvers: Mutex::new(resolvers),
            resolved_cache: Mutex::new(Vec::new()),
            fail_times: Mutex::new(FailTimes::default()),
        }
    }

    /// Create a bootstrapper that always yields pre-resolved addresses
    pub fn with_resolved(host: &str, addrs: Vec<SocketAddr>) -> Self {
        Self {
            server_name: host.to_string(),
            server_port: addrs.first().map(|a| a.port()).unwrap_or(0),
            timeout: MIN_TRY_TIMEOUT,
            ipv6_available: true,
            resolvers: Mutex::new(Vec::new()),
            resolved_cache: Mutex::new(addrs),
            fail_times: Mutex::new(FailTimes::default()),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Resolved addresses for the server, cached across calls
    pub async fn get(&self) -> Result<Vec<SocketAddr>> {
        // Literal addresses resolve to themselves.
        if let Ok(ip) = self.server_name.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, self.server_port)]);
        }

        {
            let cache = self.resolved_cache.lock().unwrap();
            if !cache.is_empty() {
                return Ok(cache.clone());
            }
        }
        self.temporary_disabler_check()?;

        let result = self.resolve().await;
        self.temporary_disabler_update(result.is_err());
        let addrs = result?;
        *self.resolved_cache.lock().unwrap() = addrs.clone();
        Ok(addrs)
    }

    /// Drop a resolved address that turned out to be unreachable
    pub fn remove_resolved(&self, addr: SocketAddr) {
        self.resolved_cache.lock().unwrap().retain(|a| *a != addr);
    }

    /// Iterate resolvers with per-try budgets, rotating failures backwards
    async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let resolvers = self.resolvers.lock().unwrap().clone();
        if resolvers.is_empty() {
            return Err(DnsError::Bootstrap(format!(
                "empty bootstrap list for {}",
                self.server_name
            )));
        }

        let mut remaining = self.timeout;
        let mut last_error = None;
        for (tried, resolver) in resolvers.iter().enumerate() {
            let try_timeout = std::cmp::max(remaining / 2, MIN_TRY_TIMEOUT);
            let started = Instant::now();
            match resolve_host(*resolver, &self.server_name, self.server_port, try_timeout, self.ipv6_available)
                .await
            {
                Ok(addrs) if !addrs.is_empty() => {
                    for addr in &addrs {
                        log::debug!("[{}] resolved address: {}", self.server_name, addr);
                    }
                    return Ok(addrs);
                }
                Ok(_) => {
                    last_error = Some(DnsError::Bootstrap(format!(
                        "{} returned no addresses for {}",
                        resolver, self.server_name
                    )));
                }
                Err(e) => {
                    log::debug!("[{}] failed to resolve host: {}", self.server_name, e);
                    last_error = Some(e);
                }
            }
            // Give the failing resolver a chance later by moving it back.
            {
                let mut list = self.resolvers.lock().unwrap();
                if let Some(pos) = list.iter().position(|a| a == resolver) {
                    let failed = list.remove(pos);
                    list.push(failed);
                }
            }
            remaining = remaining.saturating_sub(started.elapsed());
            if remaining <= MIN_TRY_TIMEOUT && tried + 1 < resolvers.len() {
                log::debug!(
                    "[{}] stop resolving loop as timeout reached ({:?})",
                    self.server_name,
                    self.timeout
                );
                break;
            }
        }
        Err(last_error.unwrap_or_else(|| {
            DnsError::Bootstrap(format!("failed to resolve {}", self.server_name))
        }))
    }

    fn temporary_disabler_check(&self) -> Result<()> {
        let fail_times = self.fail_times.lock().unwrap();
        let (Some(first), Some(last)) = (fail_times.first, fail_times.last) else {
            return Ok(());
        };
        let tries_deadline = first + RESOLVE_TRYING_INTERVAL;
        if last <= tries_deadline {
            return Ok(());
        }
        let disabled_for = Instant::now().saturating_duration_since(tries_deadline);
        if disabled_for < TEMPORARY_DISABLE_INTERVAL {
            let remaining = TEMPORARY_DISABLE_INTERVAL - disabled_for;
            return Err(DnsError::Bootstrap(format!(
                "bootstrapping {} is disabled for {:?}, too many failures",
                self.server_name, remaining
            )));
        }
        drop(fail_times);
        self.fail_times.lock().unwrap().first = None;
        Ok(())
    }

    fn temporary_disabler_update(&self, failed: bool) {
        let mut fail_times = self.fail_times.lock().unwrap();
        if failed {
            let now = Instant::now();
            fail_times.last = Some(now);
            if fail_times.first.is_none() {
                fail_times.first = Some(now);
            }
        } else {
            fail_times.first = None;
        }
    }
}

fn parse_resolver_addr(server: &str) -> Option<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, 53));
    }
    log::warn!("failed to parse bootstrap resolver '{}'", server);
    None
}

/// One plain-DNS lookup of `host` against `resolver`
async fn resolve_host(
    resolver: SocketAddr,
    host: &str,
    port: u16,
    timeout: Duration,
    ipv6_available: bool,
) -> Result<Vec<SocketAddr>> {
    let name = Name::from_utf8(format!("{}.", host.trim_end_matches('.')))
        .map_err(|e| DnsError::Bootstrap(format!("bad hostname {}: {}", host, e)))?;

    let mut addrs = Vec::new();
    let mut rr_types = vec![RecordType::A];
    if ipv6_available {
        rr_types.push(RecordType::AAAA);
    }
    for rr_type in rr_types {
        let mut query = Message::new();
        query.set_id(rand::rng().random());
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.set_recursion_desired(true);
        query.add_query(Query::query(name.clone(), rr_type));
        let encoded = query
            .to_vec()
            .map_err(|e| DnsError::Encode(e.to_string()))?;

        let mut socket = AioSocket::connect_udp(resolver, Some(timeout)).await?;
        socket.send_dns_packet(&encoded).await?;
        let raw = socket.receive_dns_packet(Some(timeout)).await?;
        let response =
            Message::from_vec(&raw).map_err(|e| DnsError::Decode(e.to_string()))?;

        for record in response.answers() {
            match record.data() {
                RData::A(a) => addrs.push(SocketAddr::new(IpAddr::V4(a.0), port)),
                RData::AAAA(aaaa) => addrs.push(SocketAddr::new(IpAddr::V6(aaaa.0), port)),
                _ => {}
            }
        }
        // One address family is enough to dial.
        if !addrs.is_empty() {
            break;
        }
    }
    Ok(addrs)
}
