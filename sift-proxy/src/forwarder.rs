//! The request-processing pipeline
//!
//! One asynchronous pass per request: decode, retransmission detection,
//! cache probe, special rewrites, question filtering, upstream selection and
//! racing, answer-side filtering, DNS64 synthesis, ECH and DNSSEC scrubbing,
//! truncation, cache write, event. Every await is followed by a check of the
//! weak shutdown token; an expired token produces an empty reply and no
//! published state.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use tokio::sync::mpsc;

use sift_net::{Connector, SocksOutboundProxy, SocksProxySettings};

use crate::cache::ResponseCache;
use crate::config::{
    DnsMessageInfo, DnsProxySettings, Dns64Settings, TransportProtocol, UpstreamOptions,
};
use crate::dns64::{self, Dns64State};
use crate::error::{DnsError, InitError, Result};
use crate::events::{now_millis, DnsProxyEvents, DnsRequestProcessedEvent};
use crate::filter::{
    apply_dnsrewrite_rules, get_effective_rules, make_fallback_filter_params, DnsFilter,
    FilterHandle, MatchParam, Rule,
};
use crate::response;
use crate::retransmit::RetransmissionDetector;
use crate::upstream::{Upstream, UpstreamFactory, UpstreamFactoryConfig};
use crate::verify::build_tls_config;

/// A reply needs at least the 16-bit transport id; shorter input is dropped
/// silently, anything else undecodable gets a FORMERR carrying that id
const MIN_MESSAGE_LEN: usize = 2;

/// Canary name Firefox probes before enabling its own DoH
const MOZILLA_DOH_HOST: &str = "use-application-dns.net.";

/// Retry interval of the SOA synthesized for blocked AAAA queries
const SOA_RETRY_IPV6_BLOCK: u32 = 60;

/// Weak handle that expires when the forwarder shuts down
#[derive(Clone)]
pub(crate) struct ShutdownToken(Weak<()>);

impl ShutdownToken {
    pub(crate) fn is_expired(&self) -> bool {
        self.0.strong_count() == 0
    }
}

/// The end-to-end request processor
pub struct DnsForwarder {
    settings: Arc<DnsProxySettings>,
    events: DnsProxyEvents,
    upstreams: Vec<Arc<dyn Upstream>>,
    fallbacks: Vec<Arc<dyn Upstream>>,
    filter: DnsFilter,
    filter_handle: Option<FilterHandle>,
    fallback_filter_handle: Option<FilterHandle>,
    cache: Mutex<ResponseCache>,
    retransmissions: Mutex<RetransmissionDetector>,
    dns64_state: Arc<Dns64State>,
    shutdown_guard: Mutex<Option<Arc<()>>>,
}

impl DnsForwarder {
    /// Build the forwarder: upstreams, filters, cache, DNS64 discovery
    pub async fn init(
        settings: DnsProxySettings,
        events: DnsProxyEvents,
    ) -> std::result::Result<Arc<Self>, InitError> {
        log::info!("initializing forwarder");

        if let Some(custom) = &settings.custom_blocking_ipv4 {
            if custom.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(InitError::InvalidIpv4(custom.clone()));
            }
        }
        if let Some(custom) = &settings.custom_blocking_ipv6 {
            if custom.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(InitError::InvalidIpv6(custom.clone()));
            }
        }

        let connector = match &settings.outbound_proxy {
            Some(proxy) => Connector::Socks(SocksOutboundProxy::new(SocksProxySettings {
                protocol: proxy.protocol,
                address: proxy.address,
                auth: proxy.auth.clone(),
                on_proxy_connection_failed: None,
            })),
            None => Connector::Direct,
        };
        let tls_config = Arc::new(build_tls_config(&events).map_err(|e| {
            log::error!("failed to build the TLS configuration: {}", e);
            InitError::UpstreamInit
        })?);

        let factory = UpstreamFactory::new(UpstreamFactoryConfig {
            connector,
            tls_config,
            outbound_proxy: settings.outbound_proxy.clone(),
            ipv6_available: settings.ipv6_available,
            enable_http3: settings.enable_http3,
        });

        let mut upstreams = Vec::with_capacity(settings.upstreams.len());
        for options in &settings.upstreams {
            log::info!("initializing upstream {}", options.address);
            match factory.create_upstream(options.clone()) {
                Ok(upstream) => upstreams.push(upstream),
                Err(e) => log::error!("failed to create upstream {}: {}", options.address, e),
            }
        }
        let mut fallbacks = Vec::with_capacity(settings.fallbacks.len());
        for options in &settings.fallbacks {
            log::info!("initializing fallback upstream {}", options.address);
            // Fallbacks always dial around the outbound proxy.
            let options = UpstreamOptions {
                ignore_proxy: true,
                ..options.clone()
            };
            match factory.create_upstream(options) {
                Ok(upstream) => fallbacks.push(upstream),
                Err(e) => {
                    log::error!("failed to create fallback upstream: {}", e);
                }
            }
        }
        if upstreams.is_empty()
            && (fallbacks.is_empty() || !settings.enable_fallback_on_upstreams_failure)
        {
            return Err(InitError::UpstreamInit);
        }

        let mut seen_filter_ids = std::collections::HashSet::new();
        for list in &settings.filter_params.filters {
            if !seen_filter_ids.insert(list.id) {
                return Err(InitError::NonUniqueFilterId);
            }
        }

        let mut filter = DnsFilter::new();
        let (filter_handle, warning) = filter.create(&settings.filter_params);
        if filter_handle.is_none() {
            return Err(InitError::FilterLoad(
                warning.unwrap_or_else(|| "failed to create the rule engine".into()),
            ));
        }
        if let Some(warning) = warning {
            log::warn!("filtering module initialized with warnings:\n{}", warning);
        }

        let fallback_filter_handle = if settings.fallback_domains.is_empty() {
            None
        } else {
            let params = make_fallback_filter_params(&settings.fallback_domains);
            let (handle, warning) = filter.create(&params);
            // The fallback filter is built from our own rules; a warning
            // means a pattern slipped through validation.
            if let Some(warning) = warning {
                return Err(InitError::FallbackFilterInit(warning));
            }
            handle
        };

        let shutdown_guard = Arc::new(());
        let token = ShutdownToken(Arc::downgrade(&shutdown_guard));
        let dns64_state = Arc::new(Dns64State::new());
        if let Some(dns64_settings) = settings.dns64.clone() {
            log::info!("DNS64 discovery is enabled");
            tokio::spawn(discover_dns64_prefixes(
                factory,
                dns64_settings,
                dns64_state.clone(),
                token.clone(),
            ));
        }

        let forwarder = Arc::new(Self {
            cache: Mutex::new(ResponseCache::new(settings.dns_cache_size.max(1))),
            settings: Arc::new(settings),
            events,
            upstreams,
            fallbacks,
            filter,
            filter_handle,
            fallback_filter_handle,
            retransmissions: Mutex::new(RetransmissionDetector::new()),
            dns64_state,
            shutdown_guard: Mutex::new(Some(shutdown_guard)),
        });
        log::info!("forwarder initialized");
        Ok(forwarder)
    }

    /// Cooperative shutdown: expire the token and drop cached state
    pub fn deinit(&self) {
        log::info!("deinitializing forwarder");
        self.shutdown_guard.lock().unwrap().take();
        self.cache.lock().unwrap().clear();
    }

    pub fn settings(&self) -> &DnsProxySettings {
        &self.settings
    }

    fn token(&self) -> ShutdownToken {
        let guard = self.shutdown_guard.lock().unwrap();
        match guard.as_ref() {
            Some(strong) => ShutdownToken(Arc::downgrade(strong)),
            None => ShutdownToken(Weak::new()),
        }
    }

    /// Process one raw client message; an empty result means "do not reply"
    pub async fn handle_message(
        self: &Arc<Self>,
        message: &[u8],
        info: Option<&DnsMessageInfo>,
    ) -> Vec<u8> {
        let token = self.token();
        if token.is_expired() {
            return Vec::new();
        }
        if message.len() < MIN_MESSAGE_LEN {
            log::debug!("not responding to malformed message");
            return Vec::new();
        }
        let pkt_id = u16::from_be_bytes([message[0], message[1]]);

        let retransmission_handling = self.settings.enable_retransmission_handling
            && info.is_some_and(|i| i.proto == TransportProtocol::Udp);
        let mut retransmitted = false;
        if retransmission_handling {
            let peer = info.unwrap().peer;
            if self.retransmissions.lock().unwrap().register(pkt_id, peer) > 1 {
                log::debug!("detected retransmitted request [{}] from {}", pkt_id, peer);
                retransmitted = true;
            }
        }

        let result = self
            .handle_message_internal(message, info, retransmitted, pkt_id, &token)
            .await;
        if token.is_expired() {
            return Vec::new();
        }

        if retransmission_handling {
            let peer = info.unwrap().peer;
            let was_retransmitted = self.retransmissions.lock().unwrap().deregister(pkt_id, peer);
            if was_retransmitted && !retransmitted {
                // The duplicate handler owns the reply.
                log::debug!("suppressing response to retransmitted request [{}]", pkt_id);
                return Vec::new();
            }
        }
        result
    }

    async fn handle_message_internal(
        self: &Arc<Self>,
        message: &[u8],
        info: Option<&DnsMessageInfo>,
        fallback_only: bool,
        pkt_id: u16,
        token: &ShutdownToken,
    ) -> Vec<u8> {
        let mut event = DnsRequestProcessedEvent::start();
        event.bytes_sent = message.len();

        let mut request = match Message::from_vec(message) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("failed to parse payload: {}", e);
                let error = DnsError::Decode(e.to_string());
                self.finalize_event(&mut event, None, None, None, None, Some(&error));
                let response = response::create_formerr_response(pkt_id);
                return encode_or_empty(&response);
            }
        };

        let Some(question) = request.queries().first().cloned() else {
            let response = response::create_servfail_response(&request);
            let error = DnsError::Decode("no question in request".into());
            self.finalize_event(&mut event, None, Some(&response), None, None, Some(&error));
            return encode_or_empty(&response);
        };

        let domain = question.name().to_string();
        event.domain = domain.clone();
        let normalized_domain = domain.trim_end_matches('.').to_lowercase();
        let rr_type = question.query_type();

        // Cache probe. Expired entries are only served optimistically, and
        // then trigger a background refresh.
        let cached = if self.settings.dns_cache_size > 0 {
            self.cache.lock().unwrap().get(&request)
        } else {
            Default::default()
        };
        if let Some(mut cached_response) = cached.response {
            if !cached.expired || self.settings.optimistic_cache {
                log::debug!("[{}] serving cached response", request.id());
                event.cache_hit = true;
                response::truncate_response(&mut cached_response, &request, info);
                self.finalize_event(
                    &mut event,
                    Some(&request),
                    Some(&cached_response),
                    None,
                    cached.upstream_id,
                    None,
                );
                let raw = encode_or_empty(&cached_response);
                if cached.expired {
                    let forwarder = self.clone();
                    let background_request = request.clone();
                    let background_domain = normalized_domain.clone();
                    tokio::spawn(async move {
                        forwarder
                            .optimistic_cache_background_resolve(background_request, background_domain)
                            .await;
                    });
                }
                return raw;
            }
        }

        // Mozilla DoH canary: always NXDOMAIN so clients keep using us.
        if matches!(rr_type, RecordType::A | RecordType::AAAA) && domain == MOZILLA_DOH_HOST {
            let response = response::create_nxdomain_response(&request, &self.settings);
            self.finalize_event(&mut event, Some(&request), Some(&response), None, None, None);
            return encode_or_empty(&response);
        }

        let mut last_effective_rules: Vec<Rule> = Vec::new();

        // IPv6 blocking: AAAA queries get a short-retry SOA unless a filter
        // rule produced a response of its own.
        if self.settings.block_ipv6 && rr_type == RecordType::AAAA {
            let mut rcode = ResponseCode::NoError;
            let filtered = self
                .apply_filter(
                    &normalized_domain,
                    rr_type,
                    &request,
                    None,
                    &mut event,
                    &mut last_effective_rules,
                    fallback_only,
                    true,
                    Some(&mut rcode),
                )
                .await;
            if token.is_expired() {
                return Vec::new();
            }
            match filtered {
                Some(raw) if rcode != ResponseCode::NoError => return raw,
                filtered => {
                    log::debug!("[{}] AAAA query blocked because IPv6 blocking is enabled", request.id());
                    let response =
                        response::create_soa_response(&request, &self.settings, SOA_RETRY_IPV6_BLOCK);
                    // A NOERROR filter result already fired its own event.
                    if filtered.is_none() {
                        self.finalize_event(&mut event, Some(&request), Some(&response), None, None, None);
                    }
                    return encode_or_empty(&response);
                }
            }
        }

        // Question filtering.
        let filtered = self
            .apply_filter(
                &normalized_domain,
                rr_type,
                &request,
                None,
                &mut event,
                &mut last_effective_rules,
                fallback_only,
                true,
                None,
            )
            .await;
        if token.is_expired() {
            return Vec::new();
        }
        if let Some(raw) = filtered {
            return raw;
        }

        let is_our_do_bit = self.settings.enable_dnssec_ok && response::set_do_bit(&mut request);

        // Upstream exchange; retransmitted requests go fallback-only.
        let (result, selected_upstream) = self
            .do_upstreams_exchange(&normalized_domain, &request, fallback_only, token)
            .await;
        if token.is_expired() {
            return Vec::new();
        }

        let mut upstream_response = match result {
            Ok(response) => response,
            Err(error) => {
                if !self.settings.enable_servfail_on_upstreams_failure {
                    log::debug!("[{}] not responding, upstreams exchange error: {}", request.id(), error);
                    return Vec::new();
                }
                let response = response::create_servfail_response(&request);
                self.finalize_event(
                    &mut event,
                    Some(&request),
                    Some(&response),
                    None,
                    selected_upstream.as_ref().map(|u| u.options().id),
                    Some(&DnsError::Exchange(error.to_string())),
                );
                return encode_or_empty(&response);
            }
        };

        let selected_upstream = match selected_upstream {
            Some(upstream) => upstream,
            None => {
                // Cannot happen for a successful exchange.
                return Vec::new();
            }
        };
        log::debug!(
            "[{}] upstream ({}) response: {:?}",
            request.id(),
            selected_upstream.options().address,
            upstream_response.response_code()
        );

        if upstream_response.response_code() == ResponseCode::NoError {
            // Answer-side filtering: CNAME targets and answer addresses.
            let answers = upstream_response.answers().to_vec();
            for record in &answers {
                let blocked = match record.data() {
                    RData::CNAME(cname) => {
                        let target = cname.0.to_string().trim_end_matches('.').to_lowercase();
                        log::trace!("[{}] response CNAME: {}", request.id(), target);
                        self.apply_filter(
                            &target,
                            RecordType::CNAME,
                            &request,
                            Some(&upstream_response),
                            &mut event,
                            &mut last_effective_rules,
                            fallback_only,
                            true,
                            None,
                        )
                        .await
                    }
                    RData::A(a) => {
                        self.apply_filter(
                            &a.0.to_string(),
                            RecordType::A,
                            &request,
                            Some(&upstream_response),
                            &mut event,
                            &mut last_effective_rules,
                            fallback_only,
                            true,
                            None,
                        )
                        .await
                    }
                    RData::AAAA(aaaa) => {
                        self.apply_filter(
                            &aaaa.0.to_string(),
                            RecordType::AAAA,
                            &request,
                            Some(&upstream_response),
                            &mut event,
                            &mut last_effective_rules,
                            fallback_only,
                            true,
                            None,
                        )
                        .await
                    }
                    _ => None,
                };
                if token.is_expired() {
                    return Vec::new();
                }
                if let Some(raw) = blocked {
                    return raw;
                }
            }

            // DNS64: synthesize AAAA from A through the same upstream.
            if self.settings.dns64.is_some()
                && rr_type == RecordType::AAAA
                && !dns64::has_aaaa_answers(&upstream_response)
            {
                if let Some(synthesized) = self
                    .try_dns64_aaaa_synthesis(&selected_upstream, &request)
                    .await
                {
                    log::debug!("[{}] synthesized DNS64 response", request.id());
                    upstream_response = synthesized;
                }
                if token.is_expired() {
                    return Vec::new();
                }
            }

            if self.settings.block_ech && response::remove_ech_svcparams(&mut upstream_response) {
                log::debug!("[{}] removed ECH parameters from SVCB/HTTPS records", request.id());
            }
        }

        if self.settings.enable_dnssec_ok {
            event.dnssec = response::has_rrsigs(&upstream_response);
            if is_our_do_bit && response::scrub_dnssec_records(&mut upstream_response) {
                log::debug!("[{}] scrubbed DNSSEC records from response", request.id());
            }
        }

        response::truncate_response(&mut upstream_response, &request, info);
        let raw = encode_or_empty(&upstream_response);
        event.bytes_received = raw.len();
        self.finalize_event(
            &mut event,
            Some(&request),
            Some(&upstream_response),
            None,
            Some(selected_upstream.options().id),
            None,
        );
        if self.settings.dns_cache_size > 0 {
            self.cache.lock().unwrap().put(
                &request,
                upstream_response,
                Some(selected_upstream.options().id),
            );
        }
        raw
    }

    /// Match `domain` against the engine and build a blocking response if a
    /// block rule wins
    #[allow(clippy::too_many_arguments)]
    async fn apply_filter(
        self: &Arc<Self>,
        domain: &str,
        rr_type: RecordType,
        request: &Message,
        original_response: Option<&Message>,
        event: &mut DnsRequestProcessedEvent,
        last_effective_rules: &mut Vec<Rule>,
        fallback_only: bool,
        fire_event: bool,
        out_rcode: Option<&mut ResponseCode>,
    ) -> Option<Vec<u8>> {
        let handle = self.filter_handle?;
        let mut rules = self
            .filter
            .match_request(handle, &MatchParam { domain, rr_type });
        for rule in &rules {
            log::trace!("[{}] matched rule: {}", request.id(), rule.text);
        }
        rules.append(last_effective_rules);

        let mut effective = get_effective_rules(rules);
        let mut rewrite_info = None;
        if !effective.dnsrewrite.is_empty() {
            let applied = apply_dnsrewrite_rules(&effective.dnsrewrite);
            for rule in &applied.rules {
                log::trace!("[{}] applied $dnsrewrite: {}", request.id(), rule.text);
            }
            effective.dnsrewrite = applied.rules;
            rewrite_info = applied.rewrite_info;
        }

        *last_effective_rules = effective
            .dnsrewrite
            .iter()
            .chain(effective.leftovers.iter())
            .cloned()
            .collect();

        event_append_rules(event, &effective.dnsrewrite);
        if rewrite_info.is_none() {
            event_append_rules(event, &effective.leftovers);
        }

        // An exception wins: no block.
        if rewrite_info.is_none()
            && (effective.leftovers.is_empty()
                || effective.leftovers.first().is_some_and(Rule::is_exception))
        {
            return None;
        }

        if effective.dnsrewrite.is_empty() {
            log::debug!(
                "[{}] query blocked by rule: {}",
                request.id(),
                effective.leftovers[0].text
            );
        } else {
            log::debug!(
                "[{}] query blocked by $dnsrewrite rules: {}",
                request.id(),
                effective.dnsrewrite.len()
            );
        }

        // A rewritten CNAME needs resolving before the answer can be built.
        let mut resolved = Vec::new();
        if let Some(info) = rewrite_info.as_ref() {
            if let Some(cname) = &info.cname {
                let target = cname.trim_end_matches('.');
                let Ok(name) = hickory_proto::rr::Name::from_utf8(format!("{}.", target)) else {
                    log::debug!("[{}] bad rewritten cname '{}'", request.id(), cname);
                    return None;
                };
                let qtype = request.queries()[0].query_type();
                let mut rewritten = Message::new();
                rewritten.set_id(request.id());
                rewritten.set_recursion_desired(request.recursion_desired());
                rewritten.set_checking_disabled(request.checking_disabled());
                rewritten.add_query(hickory_proto::op::Query::query(name, qtype));

                let token = self.token();
                let (result, _) = self
                    .do_upstreams_exchange(target, &rewritten, fallback_only, &token)
                    .await;
                match result {
                    Ok(cname_response) => {
                        for record in cname_response.answers() {
                            if record.record_type() == qtype {
                                resolved.push(record.clone());
                            }
                        }
                    }
                    Err(e) => {
                        log::debug!("[{}] failed to resolve rewritten cname: {}", request.id(), e);
                        return None;
                    }
                }
            }
        }

        let blocking_response = response::create_blocking_response(
            request,
            &self.settings,
            &effective.leftovers,
            rewrite_info.as_ref(),
            &resolved,
        );
        if let Some(out_rcode) = out_rcode {
            *out_rcode = blocking_response.response_code();
        }
        let raw = encode_or_empty(&blocking_response);
        if fire_event {
            self.finalize_event(
                event,
                Some(request),
                Some(&blocking_response),
                original_response,
                None,
                None,
            );
        }
        Some(raw)
    }

    /// Refresh an optimistically served cache entry
    async fn optimistic_cache_background_resolve(
        self: Arc<Self>,
        request: Message,
        normalized_domain: String,
    ) {
        log::debug!("[{}] starting async upstream exchange for {}", request.id(), normalized_domain);
        let token = self.token();
        let (result, upstream) = self
            .do_upstreams_exchange(&normalized_domain, &request, false, &token)
            .await;
        if token.is_expired() {
            return;
        }
        match result {
            Ok(fresh) => {
                self.cache.lock().unwrap().put(
                    &request,
                    fresh,
                    upstream.map(|u| u.options().id),
                );
            }
            Err(e) => {
                log::debug!(
                    "[{}] async upstream exchange failed, removing entry from cache: {}",
                    request.id(),
                    e
                );
                self.cache.lock().unwrap().erase(&request);
            }
        }
    }

    /// Build an A sub-query through the selected upstream and synthesize
    /// AAAA records into the discovered prefixes
    async fn try_dns64_aaaa_synthesis(
        &self,
        upstream: &Arc<dyn Upstream>,
        request: &Message,
    ) -> Option<Message> {
        let prefixes = self.dns64_state.prefixes();
        if prefixes.is_empty() {
            return None;
        }
        let question = request.queries().first()?;

        let mut a_request = Message::new();
        a_request.set_id(rand::rng().random());
        a_request.set_recursion_desired(request.recursion_desired());
        a_request.set_checking_disabled(request.checking_disabled());
        a_request.add_query(hickory_proto::op::Query::query(
            question.name().clone(),
            RecordType::A,
        ));

        let a_response = match upstream.exchange(&a_request).await {
            Ok(response) => response,
            Err(e) => {
                log::debug!("DNS64: upstream failed to perform A query: {}", e);
                return None;
            }
        };
        if a_response.answers().is_empty() {
            log::debug!("DNS64: upstream returned no A records");
            return None;
        }

        let records = dns64::synthesize_aaaa_records(&a_response, &prefixes)?;
        let mut synthesized = Message::new();
        synthesized.set_id(request.id());
        synthesized.set_message_type(hickory_proto::op::MessageType::Response);
        synthesized.set_recursion_desired(request.recursion_desired());
        synthesized.set_recursion_available(a_response.recursion_available());
        synthesized.set_checking_disabled(a_response.checking_disabled());
        synthesized.add_query(question.clone());
        for record in records {
            synthesized.add_answer(record);
        }
        Some(synthesized)
    }

    /// Whether the fallback-domain filter routes this query to fallbacks
    fn apply_fallback_filter(&self, normalized_domain: &str, rr_type: RecordType) -> bool {
        let Some(handle) = self.fallback_filter_handle else {
            return false;
        };
        let rules = self.filter.match_request(
            handle,
            &MatchParam {
                domain: normalized_domain,
                rr_type,
            },
        );
        if let Some(rule) = rules.first() {
            log::debug!("{} matches fallback filter rule: {}", normalized_domain, rule.text);
            return true;
        }
        false
    }

    /// Route the request to a pool and do the exchange
    async fn do_upstreams_exchange(
        self: &Arc<Self>,
        normalized_domain: &str,
        request: &Message,
        force_fallback: bool,
        token: &ShutdownToken,
    ) -> (Result<Message>, Option<Arc<dyn Upstream>>) {
        let rr_type = request
            .queries()
            .first()
            .map(|q| q.query_type())
            .unwrap_or(RecordType::A);
        let use_fallbacks = !self.fallbacks.is_empty()
            && (force_fallback || self.apply_fallback_filter(normalized_domain, rr_type));

        let pool = if use_fallbacks { &self.fallbacks } else { &self.upstreams };
        let error_rtt = 2 * max_rtt(pool);

        // Fallbacks always race with wait-all semantics.
        if use_fallbacks || self.settings.enable_parallel_upstream_queries {
            return do_parallel_exchange(pool, request, error_rtt, use_fallbacks, token).await;
        }

        // Weighted random selection over the primaries.
        let mut candidates = pool.clone();
        let mut last: Option<(Result<Message>, Arc<dyn Upstream>)> = None;
        while !candidates.is_empty() {
            let rtts: Vec<_> = candidates.iter().map(|u| u.rtt_estimate()).collect();
            let idx = pick_weighted(&rtts, &mut rand::rng());
            let upstream = candidates[idx].clone();

            let result = single_exchange(&upstream, request, error_rtt, token).await;
            if token.is_expired() {
                return (Err(DnsError::ShuttingDown), None);
            }
            match result {
                Ok(response) => return (Ok(response), Some(upstream)),
                Err(e) if e.is_timeout() => {
                    // The client has likely given up; no point trying others.
                    return (Err(e), Some(upstream));
                }
                Err(e) => {
                    // Disqualify this upstream for the request and redraw.
                    candidates.swap_remove(idx);
                    last = Some((Err(e), upstream));
                }
            }
        }

        if self.settings.enable_fallback_on_upstreams_failure && !self.fallbacks.is_empty() {
            let error_rtt = 2 * max_rtt(&self.fallbacks);
            return do_parallel_exchange(&self.fallbacks, request, error_rtt, true, token).await;
        }

        match last {
            Some((result, upstream)) => (result, Some(upstream)),
            None => (
                (Err(DnsError::Internal("no upstreams have been asked".into()))),
                None,
            ),
        }
    }

    fn finalize_event(
        &self,
        event: &mut DnsRequestProcessedEvent,
        request: Option<&Message>,
        response: Option<&Message>,
        original_response: Option<&Message>,
        upstream_id: Option<i32>,
        error: Option<&DnsError>,
    ) {
        event.query_type = request
            .and_then(|r| r.queries().first())
            .map(|q| q.query_type().to_string())
            .unwrap_or_default();
        match response {
            Some(response) => {
                event.status = format!("{:?}", response.response_code());
                event.answer = response::rr_list_to_string(response.answers());
            }
            None => {
                event.status.clear();
                event.answer.clear();
            }
        }
        event.original_answer = original_response
            .map(|r| response::rr_list_to_string(r.answers()))
            .unwrap_or_default();
        event.upstream_id = upstream_id;
        event.error = match error {
            Some(error) => {
                log::debug!("{}", error);
                error.to_string()
            }
            None => String::new(),
        };
        event.elapsed = now_millis().saturating_sub(event.start_time);
        self.events.fire_request_processed(event.clone());
    }
}

impl Drop for DnsForwarder {
    fn drop(&mut self) {
        self.shutdown_guard.lock().unwrap().take();
    }
}

fn encode_or_empty(message: &Message) -> Vec<u8> {
    match message.to_vec() {
        Ok(raw) => raw,
        Err(e) => {
            log::error!("failed to encode response: {}", e);
            Vec::new()
        }
    }
}

fn max_rtt(pool: &[Arc<dyn Upstream>]) -> Duration {
    pool.iter()
        .filter_map(|u| u.rtt_estimate())
        .max()
        .unwrap_or(Duration::ZERO)
}

fn event_append_rules(event: &mut DnsRequestProcessedEvent, rules: &[Rule]) {
    for rule in rules {
        if event.rules.contains(&rule.text) {
            continue;
        }
        event.rules.push(rule.text.clone());
        event.filter_list_ids.push(rule.filter_id);
    }
    if let Some(first) = rules.first() {
        event.whitelist = first.is_exception();
    }
}

/// One attempt against one upstream, with a single retry when the server
/// dropped the connection mid-exchange; RTT is updated on every outcome
async fn single_exchange(
    upstream: &Arc<dyn Upstream>,
    request: &Message,
    error_rtt: Duration,
    token: &ShutdownToken,
) -> Result<Message> {
    log::trace!(
        "upstream [{}] ({}) exchange starting",
        upstream.options().id,
        upstream.options().address
    );
    let started = Instant::now();
    let mut result = upstream.exchange(request).await;
    let mut elapsed = started.elapsed();
    if token.is_expired() {
        return Err(DnsError::ShuttingDown);
    }

    if result.as_ref().err().is_some_and(|e| e.is_retriable()) {
        log::trace!(
            "upstream [{}] ({}) exchange retry",
            upstream.options().id,
            upstream.options().address
        );
        let started = Instant::now();
        result = upstream.exchange(request).await;
        elapsed = started.elapsed();
        if token.is_expired() {
            return Err(DnsError::ShuttingDown);
        }
    }

    match &result {
        Ok(_) => upstream.update_rtt(elapsed),
        Err(_) => upstream.update_rtt(error_rtt),
    }
    result
}

/// Exchange against every upstream in the slice concurrently
///
/// With `wait_all` the full result set is collected and the winner chosen by
/// the total order (non-error, then NOERROR, then answer count, then input
/// order); otherwise the first non-error response wins.
async fn do_parallel_exchange(
    pool: &[Arc<dyn Upstream>],
    request: &Message,
    error_rtt: Duration,
    wait_all: bool,
    token: &ShutdownToken,
) -> (Result<Message>, Option<Arc<dyn Upstream>>) {
    if pool.is_empty() {
        return (
            Err(DnsError::Internal("no upstreams have been asked".into())),
            None,
        );
    }

    let (tx, mut rx) = mpsc::channel::<(usize, Result<Message>)>(pool.len());
    for (idx, upstream) in pool.iter().cloned().enumerate() {
        let request = request.clone();
        let token = token.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = single_exchange(&upstream, &request, error_rtt, &token).await;
            let _ = tx.send((idx, result)).await;
        });
    }
    drop(tx);

    if wait_all {
        let mut results: Vec<Option<Result<Message>>> = (0..pool.len()).map(|_| None).collect();
        while let Some((idx, result)) = rx.recv().await {
            results[idx] = Some(result);
        }
        if token.is_expired() {
            return (Err(DnsError::ShuttingDown), None);
        }
        let mut winner: Option<usize> = None;
        for idx in 0..results.len() {
            let candidate = match &results[idx] {
                Some(result) => result,
                None => continue,
            };
            match winner {
                None => winner = Some(idx),
                Some(best) => {
                    if response_beats(candidate, results[best].as_ref().unwrap()) {
                        winner = Some(idx);
                    }
                }
            }
        }
        return match winner {
            Some(idx) => (results[idx].take().unwrap(), Some(pool[idx].clone())),
            None => (
                Err(DnsError::Internal("no upstreams have been asked".into())),
                None,
            ),
        };
    }

    let mut last_error: Option<(usize, DnsError)> = None;
    while let Some((idx, result)) = rx.recv().await {
        match result {
            Ok(response) => return (Ok(response), Some(pool[idx].clone())),
            Err(e) => last_error = Some((idx, e)),
        }
    }
    if token.is_expired() {
        return (Err(DnsError::ShuttingDown), None);
    }
    match last_error {
        Some((idx, e)) => (Err(e), Some(pool[idx].clone())),
        None => (
            Err(DnsError::Internal("no upstreams have been asked".into())),
            None,
        ),
    }
}

/// Strict "is `a` better than `b`" for the wait-all total order
fn response_beats(a: &Result<Message>, b: &Result<Message>) -> bool {
    let a = match a {
        Ok(message) => message,
        Err(_) => return false,
    };
    let b = match b {
        Ok(message) => message,
        Err(_) => return true,
    };
    let (a_code, b_code) = (a.response_code(), b.response_code());
    if a_code == b_code {
        if a_code == ResponseCode::NoError {
            return a.answers().len() > b.answers().len();
        }
        return false;
    }
    a_code == ResponseCode::NoError
}

/// Draw a candidate: untried upstreams first in encounter order, then
/// weighted by `1/rtt_ms`
pub(crate) fn pick_weighted<R: Rng>(rtts: &[Option<Duration>], rng: &mut R) -> usize {
    for (idx, rtt) in rtts.iter().enumerate() {
        if rtt.is_none() {
            return idx;
        }
    }
    let weights: Vec<f64> = rtts
        .iter()
        .map(|rtt| 1.0 / (rtt.unwrap().as_millis().max(1) as f64))
        .collect();
    match WeightedIndex::new(&weights) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0,
    }
}

/// Background task: discover NAT64 prefixes with bounded retries
async fn discover_dns64_prefixes(
    factory: UpstreamFactory,
    settings: Dns64Settings,
    state: Arc<Dns64State>,
    token: ShutdownToken,
) {
    for _ in 0..settings.max_tries {
        tokio::time::sleep(settings.wait_time).await;
        if token.is_expired() {
            return;
        }
        for options in &settings.upstreams {
            let upstream = match factory.create_upstream(options.clone()) {
                Ok(upstream) => upstream,
                Err(e) => {
                    log::debug!("failed to create DNS64 upstream: {}", e);
                    continue;
                }
            };

            let mut request = Message::new();
            request.set_id(rand::rng().random());
            request.set_recursion_desired(true);
            request.add_query(hickory_proto::op::Query::query(
                hickory_proto::rr::Name::from_utf8(dns64::WELL_KNOWN_NAME).unwrap(),
                RecordType::AAAA,
            ));

            let response = match upstream.exchange(&request).await {
                Ok(response) => response,
                Err(e) => {
                    log::debug!("error discovering prefixes: {}", e);
                    continue;
                }
            };
            if token.is_expired() {
                return;
            }

            let prefixes = dns64::extract_prefixes(&response);
            if prefixes.is_empty() {
                log::debug!("no prefixes discovered, retrying");
                continue;
            }
            log::info!("DNS64 prefixes discovered: {}", prefixes.len());
            state.set_prefixes(prefixes);
            return;
        }
    }
    log::debug!("failed to discover any DNS64 prefixes");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn message_with(rcode: ResponseCode, answers: usize) -> Message {
        let mut message = Message::new();
        message.set_response_code(rcode);
        let name = hickory_proto::rr::Name::from_utf8("example.com.").unwrap();
        for i in 0..answers {
            message.add_answer(hickory_proto::rr::Record::from_rdata(
                name.clone(),
                60,
                RData::A(hickory_proto::rr::rdata::A(std::net::Ipv4Addr::new(
                    10, 0, 0, i as u8,
                ))),
            ));
        }
        message
    }

    #[test]
    fn test_parallel_tie_break_prefers_most_answers() {
        let error: Result<Message> = Err(DnsError::Exchange("down".into()));
        let one: Result<Message> = Ok(message_with(ResponseCode::NoError, 1));
        let three: Result<Message> = Ok(message_with(ResponseCode::NoError, 3));

        assert!(response_beats(&one, &error));
        assert!(response_beats(&three, &one));
        assert!(!response_beats(&one, &three));
        assert!(!response_beats(&error, &one));
    }

    #[test]
    fn test_noerror_beats_error_rcode() {
        let servfail: Result<Message> = Ok(message_with(ResponseCode::ServFail, 0));
        let noerror: Result<Message> = Ok(message_with(ResponseCode::NoError, 0));
        assert!(response_beats(&noerror, &servfail));
        assert!(!response_beats(&servfail, &noerror));
    }

    #[test]
    fn test_equal_results_do_not_beat_each_other() {
        // "Earliest in input order" falls out of a strict comparison.
        let a: Result<Message> = Ok(message_with(ResponseCode::NXDomain, 0));
        let b: Result<Message> = Ok(message_with(ResponseCode::NXDomain, 0));
        assert!(!response_beats(&a, &b));
        assert!(!response_beats(&b, &a));
    }

    #[test]
    fn test_untried_upstreams_are_selected_first() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let rtts = [Some(Duration::from_millis(10)), None, Some(Duration::from_millis(5))];
        assert_eq!(pick_weighted(&rtts, &mut rng), 1);
    }

    #[test]
    fn test_weighted_pick_is_rtt_monotone() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let rtts = [
            Some(Duration::from_millis(10)),
            Some(Duration::from_millis(100)),
        ];
        let mut fast = 0usize;
        for _ in 0..10_000 {
            if pick_weighted(&rtts, &mut rng) == 0 {
                fast += 1;
            }
        }
        // 1/10 vs 1/100 weights: the fast upstream wins ~91% of draws.
        assert!(fast > 8_000, "fast upstream picked only {} times", fast);
    }
}
