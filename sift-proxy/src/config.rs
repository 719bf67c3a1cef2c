//! Proxy settings and upstream address parsing
//!
//! Upstream addresses come in the formats the proxy recognizes:
//! - `IP[:port]` - plain DNS over UDP (with TCP retry on truncation)
//! - `tcp://IP[:port]` - plain DNS over TCP
//! - `tls://host[:port]` - DNS over TLS
//! - `https://host[:port]/path` - DNS over HTTPS
//! - `h3://host[:port]/path` - DNS over HTTPS, HTTP/3 only
//! - `quic://host[:port]` - DNS over QUIC
//! - `sdns://...` - DNSCrypt server stamp

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use url::Url;

use crate::error::InitError;

pub use sift_net::{SocksAuth, SocksProtocol};

/// Default timeout for a single upstream exchange
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport scheme of an upstream address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    /// Plain DNS over UDP with TCP retry on truncation
    Udp,
    /// Plain DNS over TCP
    Tcp,
    /// DNS over TLS
    Tls,
    /// DNS over HTTPS (HTTP/1.1 or HTTP/2, optionally raced with HTTP/3)
    Https,
    /// DNS over HTTPS, HTTP/3 only
    H3,
    /// DNS over QUIC
    Quic,
    /// DNSCrypt
    DnsCrypt,
}

impl UpstreamScheme {
    pub fn default_port(&self) -> u16 {
        match self {
            UpstreamScheme::Udp | UpstreamScheme::Tcp => 53,
            UpstreamScheme::Tls | UpstreamScheme::Quic => 853,
            UpstreamScheme::Https | UpstreamScheme::H3 => 443,
            UpstreamScheme::DnsCrypt => 443,
        }
    }
}

/// Parsed form of an upstream address string
#[derive(Debug, Clone)]
pub struct ParsedAddress {
    pub scheme: UpstreamScheme,
    /// Hostname or IP literal; empty for `sdns://` stamps
    pub host: String,
    pub port: u16,
    /// Request path for DoH upstreams
    pub path: String,
    /// The raw stamp for DNSCrypt upstreams
    pub stamp: Option<String>,
}

impl ParsedAddress {
    /// Whether the host is an IP literal (no bootstrap needed)
    pub fn host_is_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Socket address when the host is a literal
    pub fn literal_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// Parse an upstream address string into its scheme, host, port and path
pub fn parse_upstream_address(address: &str) -> Result<ParsedAddress, InitError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(InitError::UpstreamInit);
    }

    if let Some(stamp) = address.strip_prefix("sdns://") {
        if stamp.is_empty() {
            return Err(InitError::UpstreamInit);
        }
        return Ok(ParsedAddress {
            scheme: UpstreamScheme::DnsCrypt,
            host: String::new(),
            port: 443,
            path: String::new(),
            stamp: Some(address.to_string()),
        });
    }

    // Plain addresses carry no scheme; give them one so Url accepts them.
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("udp://{}", address)
    };

    let url = Url::parse(&with_scheme).map_err(|_| InitError::UpstreamInit)?;
    let scheme = match url.scheme() {
        "udp" => UpstreamScheme::Udp,
        "tcp" => UpstreamScheme::Tcp,
        "tls" => UpstreamScheme::Tls,
        "https" => UpstreamScheme::Https,
        "h3" => UpstreamScheme::H3,
        "quic" | "doq" => UpstreamScheme::Quic,
        _ => return Err(InitError::UpstreamInit),
    };

    let host = url
        .host_str()
        .ok_or(InitError::UpstreamInit)?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();
    let port = url.port().unwrap_or_else(|| scheme.default_port());
    let path = match url.path() {
        "" | "/" if matches!(scheme, UpstreamScheme::Https | UpstreamScheme::H3) => {
            "/dns-query".to_string()
        }
        p => p.to_string(),
    };

    Ok(ParsedAddress {
        scheme,
        host,
        port,
        path,
        stamp: None,
    })
}

/// Options of a single upstream resolver endpoint
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    /// Address string in one of the recognized formats
    pub address: String,
    /// Bootstrap resolvers used when the host is not an IP literal
    pub bootstrap: Vec<String>,
    /// Timeout for one exchange attempt
    pub timeout: Duration,
    /// Pre-resolved server addresses, tried before bootstrapping
    pub resolved_addrs: Vec<SocketAddr>,
    /// Stable id reported in events and cache entries
    pub id: i32,
    /// Name of the network interface to dial from
    pub outbound_interface: Option<String>,
    /// Fallback upstreams bypass the outbound proxy
    pub ignore_proxy: bool,
}

impl UpstreamOptions {
    pub fn new(address: impl Into<String>, id: i32) -> Self {
        Self {
            address: address.into(),
            bootstrap: Vec::new(),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
            resolved_addrs: Vec::new(),
            id,
            outbound_interface: None,
            ignore_proxy: false,
        }
    }
}

/// How blocking rules turn into responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockingMode {
    /// Respond with REFUSED
    #[default]
    Refused,
    /// Respond with NXDOMAIN
    Nxdomain,
    /// Respond with an address record (custom or unspecified)
    Address,
}

/// DNS64 prefix discovery configuration
#[derive(Debug, Clone)]
pub struct Dns64Settings {
    /// Upstreams queried for the well-known name during discovery
    pub upstreams: Vec<UpstreamOptions>,
    /// Discovery rounds before giving up
    pub max_tries: u32,
    /// Pause before each discovery round
    pub wait_time: Duration,
}

/// Outbound SOCKS proxy configuration
#[derive(Debug, Clone)]
pub struct OutboundProxySettings {
    pub protocol: SocksProtocol,
    /// Resolved address of the proxy server
    pub address: SocketAddr,
    pub auth: Option<SocksAuth>,
}

/// Transport the client query arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// Information about a client message, supplied by the listener
#[derive(Debug, Clone)]
pub struct DnsMessageInfo {
    pub proto: TransportProtocol,
    pub peer: SocketAddr,
}

/// A filter list to load into the rule engine
#[derive(Debug, Clone, Default)]
pub struct FilterList {
    pub id: i32,
    /// Rule lines, one per line
    pub data: String,
}

/// Parameters for the filtering module
#[derive(Debug, Clone, Default)]
pub struct FilterParams {
    pub filters: Vec<FilterList>,
}

/// Immutable proxy settings; fixed once `DnsProxy::init` returns
#[derive(Debug, Clone)]
pub struct DnsProxySettings {
    /// Primary upstreams
    pub upstreams: Vec<UpstreamOptions>,
    /// Upstreams used for fallback-routed queries
    pub fallbacks: Vec<UpstreamOptions>,
    /// Domain patterns always routed to fallbacks
    pub fallback_domains: Vec<String>,
    /// DNS64 discovery; disabled when `None`
    pub dns64: Option<Dns64Settings>,
    /// TTL of synthesized blocking responses, seconds
    pub blocked_response_ttl: u32,
    /// Filter lists for the rule engine
    pub filter_params: FilterParams,
    /// Outbound SOCKS proxy for upstream traffic
    pub outbound_proxy: Option<OutboundProxySettings>,
    /// Answer AAAA queries with an empty SOA response
    pub block_ipv6: bool,
    /// Whether IPv6 upstreams and bootstrap addresses are usable
    pub ipv6_available: bool,
    /// Blocking mode for adblock-style rules
    pub adblock_rules_blocking_mode: BlockingMode,
    /// Blocking mode for hosts-style rules
    pub hosts_rules_blocking_mode: BlockingMode,
    /// Custom IPv4 for address-mode blocking; unspecified 0.0.0.0 otherwise
    pub custom_blocking_ipv4: Option<String>,
    /// Custom IPv6 for address-mode blocking; unspecified :: otherwise
    pub custom_blocking_ipv6: Option<String>,
    /// Response cache capacity; 0 disables caching
    pub dns_cache_size: usize,
    /// Serve expired cache entries while refreshing in the background
    pub optimistic_cache: bool,
    /// Force the DO bit upstream and scrub DNSSEC records from responses
    pub enable_dnssec_ok: bool,
    /// Route retransmitted UDP queries to fallbacks and suppress the
    /// original reply
    pub enable_retransmission_handling: bool,
    /// Strip Encrypted Client Hello parameters from SVCB/HTTPS answers
    pub block_ech: bool,
    /// Query all primary upstreams in parallel
    pub enable_parallel_upstream_queries: bool,
    /// Query fallbacks after all primaries fail
    pub enable_fallback_on_upstreams_failure: bool,
    /// Synthesize SERVFAIL when every upstream fails; silence otherwise
    pub enable_servfail_on_upstreams_failure: bool,
    /// Allow HTTP/3 for DoH upstreams and race it against HTTP/2
    pub enable_http3: bool,
}

impl Default for DnsProxySettings {
    fn default() -> Self {
        Self {
            upstreams: vec![
                UpstreamOptions::new("8.8.8.8:53", 1),
                UpstreamOptions::new("8.8.4.4:53", 2),
            ],
            fallbacks: Vec::new(),
            fallback_domains: DEFAULT_FALLBACK_DOMAINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            dns64: None,
            blocked_response_ttl: 3600,
            filter_params: FilterParams::default(),
            outbound_proxy: None,
            block_ipv6: false,
            ipv6_available: true,
            adblock_rules_blocking_mode: BlockingMode::Refused,
            hosts_rules_blocking_mode: BlockingMode::Address,
            custom_blocking_ipv4: None,
            custom_blocking_ipv6: None,
            dns_cache_size: 1000,
            optimistic_cache: true,
            enable_dnssec_ok: false,
            enable_retransmission_handling: false,
            block_ech: false,
            enable_parallel_upstream_queries: false,
            enable_fallback_on_upstreams_failure: false,
            enable_servfail_on_upstreams_failure: false,
            enable_http3: false,
        }
    }
}

/// Domains that must resolve through fallbacks: local names, Wi-Fi calling
/// gateways, and router configuration hosts
pub const DEFAULT_FALLBACK_DOMAINS: &[&str] = &[
    "*.local",
    "*.lan",
    "epdg.epc.aptg.com.tw",
    "epdg.epc.att.net",
    "epdg.mobileone.net.sg",
    "primgw.vowifina.spcsdns.net",
    "swu-loopback-epdg.qualcomm.com",
    "vowifi.jio.com",
    "weconnect.globe.com.ph",
    "wlan.three.com.hk",
    "wo.vzwwo.com",
    "epdg.epc.*.pub.3gppnetwork.org",
    "ss.epdg.epc.*.pub.3gppnetwork.org",
    "dengon.docomo.ne.jp",
    "dlinkap",
    "dlinkrouter",
    "edimax.setup",
    "fritz.box",
    "gateway.2wire.net",
    "miwifi.com",
    "my.firewall",
    "my.keenetic.net",
    "netis.cc",
    "pocket.wifi",
    "router.asus.com",
    "repeater.asus.com",
    "routerlogin.com",
    "routerlogin.net",
    "tendawifi.com",
    "tendawifi.net",
    "tplinklogin.net",
    "tplinkwifi.net",
    "tplinkrepeater.net",
    "oppowifi.com",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_udp() {
        let parsed = parse_upstream_address("8.8.8.8").unwrap();
        assert_eq!(parsed.scheme, UpstreamScheme::Udp);
        assert_eq!(parsed.host, "8.8.8.8");
        assert_eq!(parsed.port, 53);
        assert!(parsed.host_is_literal());
    }

    #[test]
    fn test_parse_plain_udp_with_port() {
        let parsed = parse_upstream_address("8.8.8.8:5353").unwrap();
        assert_eq!(parsed.scheme, UpstreamScheme::Udp);
        assert_eq!(parsed.port, 5353);
    }

    #[test]
    fn test_parse_tcp() {
        let parsed = parse_upstream_address("tcp://1.1.1.1").unwrap();
        assert_eq!(parsed.scheme, UpstreamScheme::Tcp);
        assert_eq!(parsed.port, 53);
    }

    #[test]
    fn test_parse_tls() {
        let parsed = parse_upstream_address("tls://dns.quad9.net").unwrap();
        assert_eq!(parsed.scheme, UpstreamScheme::Tls);
        assert_eq!(parsed.host, "dns.quad9.net");
        assert_eq!(parsed.port, 853);
        assert!(!parsed.host_is_literal());
    }

    #[test]
    fn test_parse_https_default_path() {
        let parsed = parse_upstream_address("https://dns.google").unwrap();
        assert_eq!(parsed.scheme, UpstreamScheme::Https);
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.path, "/dns-query");
    }

    #[test]
    fn test_parse_https_explicit_path() {
        let parsed = parse_upstream_address("https://dns.google/resolve").unwrap();
        assert_eq!(parsed.path, "/resolve");
    }

    #[test]
    fn test_parse_h3() {
        let parsed = parse_upstream_address("h3://dns.google/dns-query").unwrap();
        assert_eq!(parsed.scheme, UpstreamScheme::H3);
        assert_eq!(parsed.port, 443);
    }

    #[test]
    fn test_parse_quic() {
        let parsed = parse_upstream_address("quic://dns.quad9.net").unwrap();
        assert_eq!(parsed.scheme, UpstreamScheme::Quic);
        assert_eq!(parsed.port, 853);
    }

    #[test]
    fn test_parse_sdns_stamp() {
        let parsed = parse_upstream_address("sdns://AQcAAAAAAAAADTk0LjE0MC4xNC4xNA").unwrap();
        assert_eq!(parsed.scheme, UpstreamScheme::DnsCrypt);
        assert!(parsed.stamp.is_some());
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let parsed = parse_upstream_address("tls://[2606:4700:4700::1111]:853").unwrap();
        assert_eq!(parsed.scheme, UpstreamScheme::Tls);
        assert_eq!(parsed.host, "2606:4700:4700::1111");
        assert!(parsed.host_is_literal());
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(parse_upstream_address("ftp://example.com").is_err());
        assert!(parse_upstream_address("").is_err());
    }

    #[test]
    fn test_default_settings_match_shipped_profile() {
        let settings = DnsProxySettings::default();
        assert_eq!(settings.upstreams.len(), 2);
        assert_eq!(settings.blocked_response_ttl, 3600);
        assert_eq!(settings.dns_cache_size, 1000);
        assert!(settings.optimistic_cache);
        assert_eq!(settings.adblock_rules_blocking_mode, BlockingMode::Refused);
        assert_eq!(settings.hosts_rules_blocking_mode, BlockingMode::Address);
        assert!(settings.fallback_domains.contains(&"*.local".to_string()));
    }
}
