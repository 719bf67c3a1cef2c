//! DNS64 prefix discovery and AAAA synthesis
//!
//! At startup a background task asks the configured upstreams for the
//! AAAA records of `ipv4only.arpa.` and derives the NAT64 prefixes from the
//! positions of the well-known IPv4 addresses inside them. During query
//! handling, an AAAA question that came back empty is answered by embedding
//! the A records into each discovered prefix.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record, RecordType};

/// The name whose AAAA records reveal NAT64 prefixes
pub const WELL_KNOWN_NAME: &str = "ipv4only.arpa.";

/// Well-known IPv4 addresses of `ipv4only.arpa.`
const WELL_KNOWN_V4: [Ipv4Addr; 2] = [Ipv4Addr::new(192, 0, 0, 170), Ipv4Addr::new(192, 0, 0, 171)];

/// Valid NAT64 prefix lengths, in bits, longest first
const PREFIX_LENGTHS: [usize; 6] = [96, 64, 56, 48, 40, 32];

/// A discovered NAT64 prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    /// Prefix bytes with the suffix zeroed
    addr: Ipv6Addr,
    /// Prefix length in bits
    len: usize,
}

impl Prefix {
    pub fn new(addr: Ipv6Addr, len: usize) -> Option<Self> {
        if !PREFIX_LENGTHS.contains(&len) {
            return None;
        }
        Some(Self { addr, len })
    }

    /// Embed an IPv4 address into this prefix (RFC 6052 layout; bits 64..72
    /// stay zero)
    pub fn synthesize(&self, v4: Ipv4Addr) -> Ipv6Addr {
        let mut octets = self.addr.octets();
        let v4 = v4.octets();
        match self.len {
            32 => octets[4..8].copy_from_slice(&v4),
            40 => {
                octets[5..8].copy_from_slice(&v4[..3]);
                octets[9] = v4[3];
            }
            48 => {
                octets[6..8].copy_from_slice(&v4[..2]);
                octets[9..11].copy_from_slice(&v4[2..]);
            }
            56 => {
                octets[7] = v4[0];
                octets[9..12].copy_from_slice(&v4[1..]);
            }
            64 => octets[9..13].copy_from_slice(&v4),
            96 => octets[12..16].copy_from_slice(&v4),
            _ => unreachable!("prefix lengths are validated on construction"),
        }
        octets[8] = 0;
        Ipv6Addr::from(octets)
    }

    /// Extract the IPv4 address embedded at this prefix length
    fn extract(addr: &Ipv6Addr, len: usize) -> Ipv4Addr {
        let octets = addr.octets();
        let mut v4 = [0u8; 4];
        match len {
            32 => v4.copy_from_slice(&octets[4..8]),
            40 => {
                v4[..3].copy_from_slice(&octets[5..8]);
                v4[3] = octets[9];
            }
            48 => {
                v4[..2].copy_from_slice(&octets[6..8]);
                v4[2..].copy_from_slice(&octets[9..11]);
            }
            56 => {
                v4[0] = octets[7];
                v4[1..].copy_from_slice(&octets[9..12]);
            }
            64 => v4.copy_from_slice(&octets[9..13]),
            96 => v4.copy_from_slice(&octets[12..16]),
            _ => unreachable!(),
        }
        Ipv4Addr::from(v4)
    }

    fn truncate_to_prefix(addr: &Ipv6Addr, len: usize) -> Ipv6Addr {
        let mut octets = addr.octets();
        for octet in octets.iter_mut().skip(len / 8) {
            *octet = 0;
        }
        Ipv6Addr::from(octets)
    }
}

/// Shared prefix store, owned by the forwarder
#[derive(Debug, Default)]
pub struct Dns64State {
    prefixes: Mutex<Vec<Prefix>>,
}

impl Dns64State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefixes(&self) -> Vec<Prefix> {
        self.prefixes.lock().unwrap().clone()
    }

    pub fn set_prefixes(&self, prefixes: Vec<Prefix>) {
        *self.prefixes.lock().unwrap() = prefixes;
    }

    pub fn has_prefixes(&self) -> bool {
        !self.prefixes.lock().unwrap().is_empty()
    }
}

/// Derive NAT64 prefixes from an `ipv4only.arpa.` AAAA response (RFC 7050)
pub fn extract_prefixes(response: &Message) -> Vec<Prefix> {
    let mut prefixes = Vec::new();
    for record in response.answers() {
        let RData::AAAA(aaaa) = record.data() else {
            continue;
        };
        for len in PREFIX_LENGTHS {
            if WELL_KNOWN_V4.contains(&Prefix::extract(&aaaa.0, len)) {
                let prefix = Prefix {
                    addr: Prefix::truncate_to_prefix(&aaaa.0, len),
                    len,
                };
                if !prefixes.contains(&prefix) {
                    prefixes.push(prefix);
                }
                break;
            }
        }
    }
    prefixes
}

/// Synthesize AAAA records from the A records of `response`
///
/// Non-A records (e.g. CNAMEs) are kept as they are; each A record becomes
/// one AAAA per prefix. Returns `None` when nothing could be synthesized.
pub fn synthesize_aaaa_records(response: &Message, prefixes: &[Prefix]) -> Option<Vec<Record>> {
    let mut records = Vec::new();
    let mut synthesized = 0usize;
    for record in response.answers() {
        let RData::A(a) = record.data() else {
            records.push(record.clone());
            continue;
        };
        for prefix in prefixes {
            let v6 = prefix.synthesize(a.0);
            records.push(Record::from_rdata(
                record.name().clone(),
                record.ttl(),
                RData::AAAA(v6.into()),
            ));
            synthesized += 1;
        }
    }
    (synthesized > 0).then_some(records)
}

/// Whether a response already carries AAAA answers
pub fn has_aaaa_answers(response: &Message) -> bool {
    response
        .answers()
        .iter()
        .any(|record| record.record_type() == RecordType::AAAA)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn aaaa_response(addrs: &[Ipv6Addr]) -> Message {
        let name = Name::from_str(WELL_KNOWN_NAME).unwrap();
        let mut response = Message::new();
        response.set_message_type(MessageType::Response);
        response.add_query(Query::query(name.clone(), RecordType::AAAA));
        for addr in addrs {
            response.add_answer(Record::from_rdata(name.clone(), 300, RData::AAAA(AAAA(*addr))));
        }
        response
    }

    #[test]
    fn test_extract_well_known_prefix_96() {
        // 64:ff9b::192.0.0.170
        let response = aaaa_response(&["64:ff9b::c000:aa".parse().unwrap()]);
        let prefixes = extract_prefixes(&response);
        assert_eq!(prefixes.len(), 1);
        assert_eq!(prefixes[0].len, 96);
        assert_eq!(prefixes[0].addr, "64:ff9b::".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_extract_prefix_64() {
        // Prefix 2001:db8:122:344::/64 with 192.0.0.171 at bytes 9..13.
        let addr = Ipv6Addr::from([
            0x20, 0x01, 0x0d, 0xb8, 0x01, 0x22, 0x03, 0x44, 0x00, 192, 0, 0, 171, 0, 0, 0,
        ]);
        let prefixes = extract_prefixes(&aaaa_response(&[addr]));
        assert_eq!(prefixes.len(), 1);
        assert_eq!(prefixes[0].len, 64);
    }

    #[test]
    fn test_extract_ignores_unrelated_addresses() {
        let response = aaaa_response(&["2001:db8::1".parse().unwrap()]);
        assert!(extract_prefixes(&response).is_empty());
    }

    #[test]
    fn test_extract_dedupes_prefixes() {
        let response = aaaa_response(&[
            "64:ff9b::c000:aa".parse().unwrap(),
            "64:ff9b::c000:ab".parse().unwrap(),
        ]);
        assert_eq!(extract_prefixes(&response).len(), 1);
    }

    #[test]
    fn test_synthesis_round_trip_96() {
        let prefix = Prefix::new("64:ff9b::".parse().unwrap(), 96).unwrap();
        let v6 = prefix.synthesize(Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(v6, "64:ff9b::5db8:d822".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_synthesis_skips_u_octet() {
        let prefix = Prefix::new("2001:db8:122:344::".parse().unwrap(), 64).unwrap();
        let v6 = prefix.synthesize(Ipv4Addr::new(192, 0, 2, 33));
        assert_eq!(v6.octets()[8], 0);
        assert_eq!(&v6.octets()[9..13], &[192, 0, 2, 33]);
    }

    #[test]
    fn test_synthesize_records_from_a_response() {
        let name = Name::from_str("example.com.").unwrap();
        let mut a_response = Message::new();
        a_response.set_message_type(MessageType::Response);
        a_response.add_query(Query::query(name.clone(), RecordType::A));
        a_response.add_answer(Record::from_rdata(
            name.clone(),
            120,
            RData::A(A(Ipv4Addr::new(198, 51, 100, 1))),
        ));

        let prefixes = vec![Prefix::new("64:ff9b::".parse().unwrap(), 96).unwrap()];
        let records = synthesize_aaaa_records(&a_response, &prefixes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type(), RecordType::AAAA);
        assert_eq!(records[0].ttl(), 120);
    }

    #[test]
    fn test_synthesize_returns_none_without_a_records() {
        let response = aaaa_response(&[]);
        let prefixes = vec![Prefix::new("64:ff9b::".parse().unwrap(), 96).unwrap()];
        assert!(synthesize_aaaa_records(&response, &prefixes).is_none());
    }
}
