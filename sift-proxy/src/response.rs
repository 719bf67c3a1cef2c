//! Synthesized responses and response post-processing
//!
//! Builders for the responses the forwarder makes up itself (FORMERR,
//! SERVFAIL, NXDOMAIN, SOA blocks, rule-driven blocking responses) plus the
//! rewriting passes applied to upstream responses: UDP truncation, DNSSEC
//! record scrubbing, and ECH parameter stripping.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::svcb::SvcParamKey;
use hickory_proto::rr::rdata::{HTTPS, SOA, SVCB};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use crate::config::{BlockingMode, DnsMessageInfo, DnsProxySettings, TransportProtocol};
use crate::filter::{Rule, RuleAction, RewriteInfo, RewriteValue};

/// Minimum UDP payload every client can take
pub const UDP_BASE_PAYLOAD: usize = 512;

/// EDNS payload advertised on queries the forwarder rewrites
pub const FORWARDER_EDNS_PAYLOAD: u16 = 4096;

/// SOA master name used in synthesized negative responses
const SOA_MNAME: &str = "fake-for-negative-caching.invalid.";
const SOA_RNAME: &str = "hostmaster.";
const SOA_SERIAL: u32 = 2024010100;

/// Start a response for `request`: same id and question, RD copied, RA set
fn response_base(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

fn soa_record(owner: Name, ttl: u32) -> Record {
    let soa = SOA::new(
        Name::from_str(SOA_MNAME).unwrap(),
        Name::from_str(SOA_RNAME).unwrap(),
        SOA_SERIAL,
        1800,
        900,
        604800,
        ttl,
    );
    Record::from_rdata(owner, ttl, RData::SOA(soa))
}

/// FORMERR response for an undecodable request; only the transport id from
/// the first two payload bytes is known
pub fn create_formerr_response(id: u16) -> Message {
    let mut response = Message::new();
    response.set_id(id);
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(ResponseCode::FormErr);
    response
}

pub fn create_servfail_response(request: &Message) -> Message {
    let mut response = response_base(request);
    response.set_response_code(ResponseCode::ServFail);
    response
}

/// NXDOMAIN with an SOA for negative caching
pub fn create_nxdomain_response(request: &Message, settings: &DnsProxySettings) -> Message {
    let mut response = response_base(request);
    response.set_response_code(ResponseCode::NXDomain);
    if let Some(query) = request.queries().first() {
        response.add_name_server(soa_record(query.name().clone(), settings.blocked_response_ttl));
    }
    response
}

/// Empty NOERROR with an SOA carrying the retry interval
pub fn create_soa_response(request: &Message, _settings: &DnsProxySettings, retry_ttl: u32) -> Message {
    let mut response = response_base(request);
    response.set_response_code(ResponseCode::NoError);
    if let Some(query) = request.queries().first() {
        response.add_name_server(soa_record(query.name().clone(), retry_ttl));
    }
    response
}

fn custom_blocking_ipv4(settings: &DnsProxySettings) -> Ipv4Addr {
    settings
        .custom_blocking_ipv4
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

fn custom_blocking_ipv6(settings: &DnsProxySettings) -> Ipv6Addr {
    settings
        .custom_blocking_ipv6
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Ipv6Addr::UNSPECIFIED)
}

/// Address-mode response: an A/AAAA answer for matching query types, an SOA
/// otherwise
fn address_response(
    request: &Message,
    settings: &DnsProxySettings,
    rule_addr: Option<IpAddr>,
) -> Message {
    let Some(query) = request.queries().first() else {
        return create_servfail_response(request);
    };
    let owner = query.name().clone();
    let ttl = settings.blocked_response_ttl;

    let rdata = match query.query_type() {
        RecordType::A => match rule_addr {
            Some(IpAddr::V4(ip)) => Some(RData::A(ip.into())),
            Some(IpAddr::V6(_)) => None,
            None => Some(RData::A(custom_blocking_ipv4(settings).into())),
        },
        RecordType::AAAA => match rule_addr {
            Some(IpAddr::V6(ip)) => Some(RData::AAAA(ip.into())),
            Some(IpAddr::V4(_)) => None,
            None => Some(RData::AAAA(custom_blocking_ipv6(settings).into())),
        },
        _ => None,
    };

    let mut response = response_base(request);
    response.set_response_code(ResponseCode::NoError);
    match rdata {
        Some(rdata) => {
            response.add_answer(Record::from_rdata(owner, ttl, rdata));
        }
        None => {
            response.add_name_server(soa_record(owner, ttl));
        }
    }
    response
}

/// Build the response for a blocked query
///
/// `rewrite_info` takes precedence over the leftover rules; `resolved`
/// carries answer records obtained by resolving a rewritten CNAME.
pub fn create_blocking_response(
    request: &Message,
    settings: &DnsProxySettings,
    leftovers: &[Rule],
    rewrite_info: Option<&RewriteInfo>,
    resolved: &[Record],
) -> Message {
    if let Some(info) = rewrite_info {
        return create_rewritten_response(request, settings, info, resolved);
    }

    let mode = match leftovers.first().map(|rule| &rule.action) {
        Some(RuleAction::Hosts(addr)) => {
            if settings.hosts_rules_blocking_mode == BlockingMode::Address {
                return address_response(request, settings, Some(*addr));
            }
            settings.hosts_rules_blocking_mode
        }
        _ => settings.adblock_rules_blocking_mode,
    };

    match mode {
        BlockingMode::Refused => {
            let mut response = response_base(request);
            response.set_response_code(ResponseCode::Refused);
            response
        }
        BlockingMode::Nxdomain => create_nxdomain_response(request, settings),
        BlockingMode::Address => address_response(request, settings, None),
    }
}

fn create_rewritten_response(
    request: &Message,
    settings: &DnsProxySettings,
    info: &RewriteInfo,
    resolved: &[Record],
) -> Message {
    let mut response = response_base(request);
    response.set_response_code(info.rcode);
    if info.rcode != ResponseCode::NoError {
        if let Some(query) = request.queries().first() {
            if info.rcode == ResponseCode::NXDomain {
                response
                    .add_name_server(soa_record(query.name().clone(), settings.blocked_response_ttl));
            }
        }
        return response;
    }

    let Some(query) = request.queries().first() else {
        return response;
    };
    let owner = query.name().clone();
    let qtype = query.query_type();
    let ttl = settings.blocked_response_ttl;

    if let Some(cname) = &info.cname {
        let target = Name::from_str(&format!("{}.", cname.trim_end_matches('.')))
            .unwrap_or_else(|_| owner.clone());
        response.add_answer(Record::from_rdata(
            owner.clone(),
            ttl,
            RData::CNAME(hickory_proto::rr::rdata::CNAME(target)),
        ));
        for record in resolved {
            response.add_answer(record.clone());
        }
        return response;
    }

    for value in &info.values {
        match value {
            RewriteValue::A(ip) if qtype == RecordType::A => {
                response.add_answer(Record::from_rdata(owner.clone(), ttl, RData::A((*ip).into())));
            }
            RewriteValue::Aaaa(ip) if qtype == RecordType::AAAA => {
                response.add_answer(Record::from_rdata(
                    owner.clone(),
                    ttl,
                    RData::AAAA((*ip).into()),
                ));
            }
            _ => {}
        }
    }
    response
}

/// Rebuild a message, mapping every record through `f`; `None` drops it
///
/// Queries, header flags, RCODE and EDNS state are preserved.
pub fn map_records(message: &Message, mut f: impl FnMut(&Record) -> Option<Record>) -> Message {
    let mut rebuilt = Message::new();
    rebuilt.set_id(message.id());
    rebuilt.set_message_type(message.message_type());
    rebuilt.set_op_code(message.op_code());
    rebuilt.set_authoritative(message.authoritative());
    rebuilt.set_truncated(message.truncated());
    rebuilt.set_recursion_desired(message.recursion_desired());
    rebuilt.set_recursion_available(message.recursion_available());
    rebuilt.set_authentic_data(message.authentic_data());
    rebuilt.set_checking_disabled(message.checking_disabled());
    rebuilt.set_response_code(message.response_code());
    for query in message.queries() {
        rebuilt.add_query(query.clone());
    }
    if let Some(edns) = message.extensions() {
        rebuilt.set_edns(edns.clone());
    }
    for record in message.answers() {
        if let Some(record) = f(record) {
            rebuilt.add_answer(record);
        }
    }
    for record in message.name_servers() {
        if let Some(record) = f(record) {
            rebuilt.add_name_server(record);
        }
    }
    for record in message.additionals() {
        if let Some(record) = f(record) {
            rebuilt.add_additional(record);
        }
    }
    rebuilt
}

/// Force the DO bit on a request
///
/// Returns `true` when the bit was not set by the client, i.e. the forwarder
/// owns it and must scrub DNSSEC records from the response.
pub fn set_do_bit(request: &mut Message) -> bool {
    let extensions = request.extensions_mut();
    match extensions {
        Some(edns) => {
            if edns.flags().dnssec_ok {
                false
            } else {
                edns.set_dnssec_ok(true);
                true
            }
        }
        None => {
            let mut edns = Edns::new();
            edns.set_max_payload(FORWARDER_EDNS_PAYLOAD);
            edns.set_dnssec_ok(true);
            *extensions = Some(edns);
            true
        }
    }
}

// Match by numeric type code: records whose RDATA the codec does not parse
// still carry their on-wire type. DS(43), RRSIG(46), NSEC(47), DNSKEY(48),
// NSEC3(50), NSEC3PARAM(51).
fn is_dnssec_type(rr_type: RecordType) -> bool {
    matches!(u16::from(rr_type), 43 | 46 | 47 | 48 | 50 | 51)
}

const RRSIG_TYPE_CODE: u16 = 46;

/// Whether the response carries RRSIG records in any section
pub fn has_rrsigs(response: &Message) -> bool {
    response
        .answers()
        .iter()
        .chain(response.name_servers())
        .chain(response.additionals())
        .any(|record| u16::from(record.record_type()) == RRSIG_TYPE_CODE)
}

/// Remove DNSSEC record types from every section
///
/// Returns `true` when anything was removed.
pub fn scrub_dnssec_records(response: &mut Message) -> bool {
    let before = response.answers().len()
        + response.name_servers().len()
        + response.additionals().len();
    let scrubbed = map_records(response, |record| {
        if is_dnssec_type(record.record_type()) {
            None
        } else {
            Some(record.clone())
        }
    });
    let after =
        scrubbed.answers().len() + scrubbed.name_servers().len() + scrubbed.additionals().len();
    *response = scrubbed;
    after != before
}

/// Strip Encrypted Client Hello parameters from SVCB/HTTPS answers
///
/// Returns `true` when any record was modified.
pub fn remove_ech_svcparams(response: &mut Message) -> bool {
    let mut removed = false;
    let stripped = map_records(response, |record| match record.data() {
        RData::HTTPS(https) => {
            let svcb = strip_ech(&https.0, &mut removed);
            let mut rebuilt =
                Record::from_rdata(record.name().clone(), record.ttl(), RData::HTTPS(HTTPS(svcb)));
            rebuilt.set_dns_class(record.dns_class());
            Some(rebuilt)
        }
        RData::SVCB(svcb) => {
            let svcb = strip_ech(svcb, &mut removed);
            let mut rebuilt =
                Record::from_rdata(record.name().clone(), record.ttl(), RData::SVCB(svcb));
            rebuilt.set_dns_class(record.dns_class());
            Some(rebuilt)
        }
        _ => Some(record.clone()),
    });
    if removed {
        *response = stripped;
    }
    removed
}

fn strip_ech(svcb: &SVCB, removed: &mut bool) -> SVCB {
    let params: Vec<_> = svcb
        .svc_params()
        .iter()
        .filter(|(key, _)| {
            if *key == SvcParamKey::EchConfigList {
                *removed = true;
                false
            } else {
                true
            }
        })
        .cloned()
        .collect();
    SVCB::new(svcb.svc_priority(), svcb.target_name().clone(), params)
}

/// Truncate a response that exceeds the UDP payload limit
///
/// Records are dropped from the tail (additionals, then authority, then
/// answers) until the encoding fits; TC is set whenever anything was
/// dropped. Stream transports are never truncated.
pub fn truncate_response(
    response: &mut Message,
    request: &Message,
    info: Option<&DnsMessageInfo>,
) -> bool {
    let Some(info) = info else {
        return false;
    };
    if info.proto != TransportProtocol::Udp {
        return false;
    }

    let max_size = request
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload() as usize)
        .unwrap_or(UDP_BASE_PAYLOAD)
        .max(UDP_BASE_PAYLOAD);

    let encoded_len = |m: &Message| m.to_vec().map(|b| b.len()).unwrap_or(0);
    if encoded_len(response) <= max_size {
        return false;
    }

    let mut answers = response.answers().to_vec();
    let mut authority = response.name_servers().to_vec();
    let mut additionals = response.additionals().to_vec();

    loop {
        if additionals.pop().is_none() && authority.pop().is_none() && answers.pop().is_none() {
            break;
        }
        let mut candidate = map_records(response, |_| None);
        for record in &answers {
            candidate.add_answer(record.clone());
        }
        for record in &authority {
            candidate.add_name_server(record.clone());
        }
        for record in &additionals {
            candidate.add_additional(record.clone());
        }
        candidate.set_truncated(true);
        if encoded_len(&candidate) <= max_size {
            *response = candidate;
            return true;
        }
    }

    let mut emptied = map_records(response, |_| None);
    emptied.set_truncated(true);
    *response = emptied;
    true
}

/// Render answer records for event reporting, one per line
pub fn rr_list_to_string(records: &[Record]) -> String {
    records
        .iter()
        .map(|record| record.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::DnsRewrite;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::svcb::SvcParamValue;
    use hickory_proto::rr::rdata::A;

    fn make_request(name: &str, rr_type: RecordType) -> Message {
        let mut request = Message::new();
        request.set_id(0x4242);
        request.set_recursion_desired(true);
        request.add_query(Query::query(Name::from_str(name).unwrap(), rr_type));
        request
    }

    fn settings() -> DnsProxySettings {
        DnsProxySettings::default()
    }

    #[test]
    fn test_formerr_carries_id() {
        let response = create_formerr_response(0xabcd);
        assert_eq!(response.id(), 0xabcd);
        assert_eq!(response.response_code(), ResponseCode::FormErr);
        let encoded = response.to_vec().unwrap();
        assert_eq!(&encoded[..2], &[0xab, 0xcd]);
    }

    #[test]
    fn test_soa_response_shape() {
        let request = make_request("example.com.", RecordType::AAAA);
        let response = create_soa_response(&request, &settings(), 60);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 0);
        assert_eq!(response.name_servers().len(), 1);
        let soa = &response.name_servers()[0];
        assert_eq!(soa.record_type(), RecordType::SOA);
        assert_eq!(soa.ttl(), 60);
    }

    #[test]
    fn test_nxdomain_response() {
        let request = make_request("use-application-dns.net.", RecordType::A);
        let response = create_nxdomain_response(&request, &settings());
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(response.id(), 0x4242);
    }

    #[test]
    fn test_blocking_response_refused_mode() {
        let request = make_request("ads.example.com.", RecordType::A);
        let response = create_blocking_response(&request, &settings(), &[], None, &[]);
        assert_eq!(response.response_code(), ResponseCode::Refused);
    }

    #[test]
    fn test_blocking_response_address_mode() {
        let request = make_request("ads.example.com.", RecordType::A);
        let mut s = settings();
        s.adblock_rules_blocking_mode = BlockingMode::Address;
        let response = create_blocking_response(&request, &s, &[], None, &[]);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
        assert_eq!(
            *response.answers()[0].data(),
            RData::A(A(Ipv4Addr::UNSPECIFIED))
        );
    }

    #[test]
    fn test_blocking_response_custom_address() {
        let request = make_request("ads.example.com.", RecordType::A);
        let mut s = settings();
        s.adblock_rules_blocking_mode = BlockingMode::Address;
        s.custom_blocking_ipv4 = Some("198.51.100.9".into());
        let response = create_blocking_response(&request, &s, &[], None, &[]);
        assert_eq!(
            *response.answers()[0].data(),
            RData::A(A(Ipv4Addr::new(198, 51, 100, 9)))
        );
    }

    #[test]
    fn test_rewritten_response_with_values() {
        let request = make_request("rewritten.example.", RecordType::A);
        let info = RewriteInfo {
            rcode: ResponseCode::NoError,
            values: vec![RewriteValue::A(Ipv4Addr::new(10, 0, 0, 1))],
            cname: None,
        };
        let response = create_blocking_response(&request, &settings(), &[], Some(&info), &[]);
        assert_eq!(response.answers().len(), 1);
        assert_eq!(
            *response.answers()[0].data(),
            RData::A(A(Ipv4Addr::new(10, 0, 0, 1)))
        );
    }

    #[test]
    fn test_rewritten_response_rcode() {
        let request = make_request("gone.example.", RecordType::A);
        let info = RewriteInfo {
            rcode: ResponseCode::NXDomain,
            values: Vec::new(),
            cname: None,
        };
        let response = create_blocking_response(&request, &settings(), &[], Some(&info), &[]);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[test]
    fn test_set_do_bit_ownership() {
        let mut request = make_request("example.com.", RecordType::A);
        assert!(set_do_bit(&mut request));
        assert!(request.extensions().as_ref().unwrap().flags().dnssec_ok);
        // Second call: the bit is already there, not ours.
        assert!(!set_do_bit(&mut request));
    }

    #[test]
    fn test_scrub_dnssec_records() {
        let request = make_request("signed.example.", RecordType::A);
        let mut response = response_base(&request);
        let name = Name::from_str("signed.example.").unwrap();
        response.add_answer(Record::from_rdata(
            name.clone(),
            300,
            RData::A(A(Ipv4Addr::new(1, 2, 3, 4))),
        ));
        // An opaque RRSIG shell is enough: scrubbing goes by the type code.
        let rrsig = Record::from_rdata(
            name,
            300,
            RData::Unknown {
                code: RecordType::RRSIG,
                rdata: hickory_proto::rr::rdata::null::NULL::with(vec![0u8; 4]),
            },
        );
        response.add_answer(rrsig);

        assert!(has_rrsigs(&response));
        assert!(scrub_dnssec_records(&mut response));
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.answers()[0].record_type(), RecordType::A);
    }

    #[test]
    fn test_remove_ech_svcparams() {
        let request = make_request("svc.example.", RecordType::HTTPS);
        let mut response = response_base(&request);
        let name = Name::from_str("svc.example.").unwrap();
        let svcb = SVCB::new(
            1,
            Name::root(),
            vec![
                (
                    SvcParamKey::Alpn,
                    SvcParamValue::Alpn(hickory_proto::rr::rdata::svcb::Alpn(vec!["h2".into()])),
                ),
                (
                    SvcParamKey::EchConfigList,
                    SvcParamValue::EchConfigList(hickory_proto::rr::rdata::svcb::EchConfigList(
                        vec![1, 2, 3],
                    )),
                ),
            ],
        );
        response.add_answer(Record::from_rdata(name, 300, RData::HTTPS(HTTPS(svcb))));

        assert!(remove_ech_svcparams(&mut response));
        let RData::HTTPS(https) = response.answers()[0].data() else {
            panic!("expected HTTPS rdata");
        };
        assert_eq!(https.0.svc_params().len(), 1);
        assert_eq!(https.0.svc_params()[0].0, SvcParamKey::Alpn);
        // A second pass finds nothing to strip.
        assert!(!remove_ech_svcparams(&mut response));
    }

    #[test]
    fn test_truncation_caps_udp_payload() {
        let request = make_request("big.example.", RecordType::A);
        let mut response = response_base(&request);
        let name = Name::from_str("big.example.").unwrap();
        for i in 0..100u8 {
            response.add_answer(Record::from_rdata(
                name.clone(),
                300,
                RData::A(A(Ipv4Addr::new(10, 0, 0, i))),
            ));
        }
        let info = DnsMessageInfo {
            proto: TransportProtocol::Udp,
            peer: "127.0.0.1:5000".parse().unwrap(),
        };
        assert!(truncate_response(&mut response, &request, Some(&info)));
        assert!(response.truncated());
        assert!(response.to_vec().unwrap().len() <= UDP_BASE_PAYLOAD);
    }

    #[test]
    fn test_no_truncation_over_tcp() {
        let request = make_request("big.example.", RecordType::A);
        let mut response = response_base(&request);
        let name = Name::from_str("big.example.").unwrap();
        for i in 0..100u8 {
            response.add_answer(Record::from_rdata(
                name.clone(),
                300,
                RData::A(A(Ipv4Addr::new(10, 0, 0, i))),
            ));
        }
        let info = DnsMessageInfo {
            proto: TransportProtocol::Tcp,
            peer: "127.0.0.1:5000".parse().unwrap(),
        };
        assert!(!truncate_response(&mut response, &request, Some(&info)));
        assert!(!response.truncated());
    }

    #[test]
    fn test_rewrite_dnsrewrite_type_is_exercised() {
        // Guard the enum shape the builders rely on.
        let rewrite = DnsRewrite::Rcode(ResponseCode::Refused);
        assert_eq!(rewrite, DnsRewrite::Rcode(ResponseCode::Refused));
    }
}
