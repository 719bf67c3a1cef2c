//! sift-proxy - Filtering DNS forwarding proxy core
//!
//! The request-processing pipeline of a filtering DNS proxy: cache lookup,
//! rule-based filtering at the question, CNAME-chain and answer-IP level,
//! upstream selection with RTT-weighted load balancing and parallel racing,
//! response rewriting (DNS64 synthesis, ECH stripping, DNSSEC scrubbing,
//! UDP truncation), and retransmission-aware fallback routing.
//!
//! Upstream transports: plain UDP/TCP, DNS-over-TLS, DNS-over-HTTPS (with
//! optional HTTP/3), DNS-over-QUIC, and DNSCrypt, all optionally tunneled
//! through a SOCKS outbound proxy via the `sift-net` crate.
//!
//! # Example
//!
//! ```no_run
//! use sift_proxy::{DnsProxy, DnsProxySettings, DnsProxyEvents};
//!
//! # async fn example() -> Result<(), sift_proxy::InitError> {
//! let proxy = DnsProxy::init(DnsProxySettings::default(), DnsProxyEvents::default()).await?;
//! // let response = proxy.handle_message(&query_bytes, None).await;
//! proxy.deinit();
//! # Ok(())
//! # }
//! ```

mod bootstrap;
mod cache;
mod config;
mod dns64;
pub mod error;
mod events;
mod filter;
mod forwarder;
mod proxy;
mod response;
mod retransmit;
mod upstream;
mod verify;

pub use bootstrap::Bootstrapper;
pub use cache::{CacheResult, ResponseCache};
pub use config::{
    parse_upstream_address, BlockingMode, Dns64Settings, DnsMessageInfo, DnsProxySettings,
    FilterList, FilterParams, OutboundProxySettings, ParsedAddress, SocksAuth, SocksProtocol,
    TransportProtocol, UpstreamOptions, UpstreamScheme, DEFAULT_FALLBACK_DOMAINS,
};
pub use error::{DnsError, InitError, Result};
pub use events::{
    CertificateVerificationCallback, CertificateVerificationEvent, DnsProxyEvents,
    DnsRequestProcessedEvent, RequestProcessedCallback,
};
pub use filter::{
    apply_dnsrewrite_rules, get_effective_rules, make_fallback_filter_params, DnsFilter,
    DnsRewrite, FilterHandle, HostListEngine, MatchParam, RewriteInfo, RewriteValue, Rule,
    RuleAction, RuleEngine,
};
pub use proxy::DnsProxy;
pub use retransmit::RetransmissionDetector;
pub use upstream::{Upstream, UpstreamFactory, UpstreamFactoryConfig};
