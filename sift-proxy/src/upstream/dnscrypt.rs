//! DNSCrypt upstream
//!
//! Configured by an `sdns://` server stamp. On first use the resolver's
//! signed certificate is fetched with a plain TXT query and verified against
//! the provider key from the stamp; queries are then sealed with the
//! negotiated cipher (XSalsa20-Poly1305 or XChaCha20-Poly1305), padded to a
//! 64-byte multiple, and exchanged over UDP with a TCP retry on truncation.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, OsRng};
use crypto_box::{ChaChaBox, PublicKey, SalsaBox, SecretKey};
use ed25519_dalek::{Signature, VerifyingKey};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::RngCore;

use sift_net::Connector;

use crate::config::UpstreamOptions;
use crate::error::{DnsError, Result};
use crate::upstream::{RttEstimate, Upstream};

const CERT_MAGIC: [u8; 4] = *b"DNSC";
const RESOLVER_MAGIC: [u8; 8] = *b"r6fnvWj8";
const CERT_LEN: usize = 124;

const ES_XSALSA20: u16 = 0x0001;
const ES_XCHACHA20: u16 = 0x0002;

/// Sealed queries are padded to a multiple of this
const PAD_BLOCK: usize = 64;
/// Minimum padded query length
const MIN_PADDED_LEN: usize = 256;

/// Fields of a DNSCrypt (type 0x01) server stamp
#[derive(Debug, Clone)]
pub struct DnsCryptStamp {
    pub addr: SocketAddr,
    pub provider_pk: [u8; 32],
    pub provider_name: String,
}

/// Decode the DNSCrypt profile of an `sdns://` stamp
pub fn parse_stamp(stamp: &str) -> Result<DnsCryptStamp> {
    let encoded = stamp
        .strip_prefix("sdns://")
        .ok_or_else(|| DnsError::DnsCrypt("missing sdns:// prefix".into()))?;
    let raw = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| DnsError::DnsCrypt(format!("bad stamp encoding: {}", e)))?;

    let mut cursor = 0usize;
    if take_bytes(&raw, &mut cursor, 1)?[0] != 0x01 {
        return Err(DnsError::DnsCrypt("not a DNSCrypt stamp".into()));
    }
    let _props = take_bytes(&raw, &mut cursor, 8)?;

    let addr_str = String::from_utf8(take_len_prefixed(&raw, &mut cursor)?.to_vec())
        .map_err(|_| DnsError::DnsCrypt("bad address in stamp".into()))?;
    let addr = parse_stamp_addr(&addr_str)?;

    let pk = take_len_prefixed(&raw, &mut cursor)?;
    let provider_pk: [u8; 32] = pk
        .try_into()
        .map_err(|_| DnsError::DnsCrypt("provider key must be 32 bytes".into()))?;

    let provider_name = String::from_utf8(take_len_prefixed(&raw, &mut cursor)?.to_vec())
        .map_err(|_| DnsError::DnsCrypt("bad provider name in stamp".into()))?;

    Ok(DnsCryptStamp {
        addr,
        provider_pk,
        provider_name,
    })
}

fn take_bytes<'a>(raw: &'a [u8], cursor: &mut usize, n: usize) -> Result<&'a [u8]> {
    if raw.len() < *cursor + n {
        return Err(DnsError::DnsCrypt("truncated stamp".into()));
    }
    let piece = &raw[*cursor..*cursor + n];
    *cursor += n;
    Ok(piece)
}

fn take_len_prefixed<'a>(raw: &'a [u8], cursor: &mut usize) -> Result<&'a [u8]> {
    let len = take_bytes(raw, cursor, 1)?[0] as usize;
    take_bytes(raw, cursor, len)
}

fn parse_stamp_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, 443));
    }
    Err(DnsError::DnsCrypt(format!("bad stamp address '{}'", addr)))
}

/// Negotiated cipher with the precomputed shared key
enum Cipher {
    XSalsa20(Box<SalsaBox>),
    XChaCha20(Box<ChaChaBox>),
}

impl Cipher {
    fn seal(&self, nonce: &[u8; 24], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            Cipher::XSalsa20(b) => b.encrypt(nonce, plaintext),
            Cipher::XChaCha20(b) => b.encrypt(nonce, plaintext),
        }
        .map_err(|_| DnsError::DnsCrypt("failed to seal query".into()))
    }

    fn open(&self, nonce: &[u8; 24], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            Cipher::XSalsa20(b) => b.decrypt(nonce, ciphertext),
            Cipher::XChaCha20(b) => b.decrypt(nonce, ciphertext),
        }
        .map_err(|_| DnsError::DnsCrypt("failed to open response".into()))
    }
}

/// Verified resolver identity from the certificate
struct ResolverIdentity {
    cipher: Cipher,
    client_magic: [u8; 8],
}

pub struct DnsCryptUpstream {
    options: UpstreamOptions,
    rtt: RttEstimate,
    connector: Connector,
    stamp: DnsCryptStamp,
    client_secret: SecretKey,
    identity: tokio::sync::Mutex<Option<ResolverIdentity>>,
}

impl DnsCryptUpstream {
    pub fn new(options: UpstreamOptions, connector: Connector) -> Result<Self> {
        let stamp = parse_stamp(
            options
                .address
                .as_str(),
        )?;
        Ok(Self {
            options,
            rtt: RttEstimate::new(),
            connector,
            stamp,
            client_secret: SecretKey::generate(&mut OsRng),
            identity: tokio::sync::Mutex::new(None),
        })
    }

    /// Fetch and verify the resolver certificate, caching the result
    async fn ensure_identity(&self) -> Result<()> {
        let mut slot = self.identity.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let name = Name::from_utf8(format!("{}.", self.stamp.provider_name.trim_end_matches('.')))
            .map_err(|e| DnsError::DnsCrypt(format!("bad provider name: {}", e)))?;
        let mut query = Message::new();
        query.set_id(rand::rng().next_u32() as u16);
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.set_recursion_desired(true);
        query.add_query(Query::query(name, RecordType::TXT));
        let encoded = query.to_vec().map_err(|e| DnsError::Encode(e.to_string()))?;

        let mut flow = self
            .connector
            .connect_udp(self.stamp.addr, self.options.outbound_interface.as_deref(), Some(self.options.timeout))
            .await?;
        flow.send_dns_packet(&encoded).await?;
        let raw = flow
            .receive_dns_packet(Some(self.options.timeout))
            .await?;
        let response = Message::from_vec(&raw).map_err(|e| DnsError::Decode(e.to_string()))?;

        let verifying_key = VerifyingKey::from_bytes(&self.stamp.provider_pk)
            .map_err(|e| DnsError::DnsCrypt(format!("bad provider key: {}", e)))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as u32;

        // Pick the newest valid certificate among the TXT strings.
        let mut best: Option<(u32, ResolverIdentity)> = None;
        for record in response.answers() {
            let RData::TXT(txt) = record.data() else {
                continue;
            };
            let cert: Vec<u8> = txt.txt_data().iter().flat_map(|s| s.iter().copied()).collect();
            match self.verify_certificate(&cert, &verifying_key, now) {
                Ok((serial, identity)) => {
                    if best.as_ref().is_none_or(|(s, _)| serial > *s) {
                        best = Some((serial, identity));
                    }
                }
                Err(e) => log::debug!("[{}] skipping certificate: {}", self.options.address, e),
            }
        }

        let (_, identity) =
            best.ok_or_else(|| DnsError::DnsCrypt("no valid certificate".into()))?;
        *slot = Some(identity);
        Ok(())
    }

    fn verify_certificate(
        &self,
        cert: &[u8],
        verifying_key: &VerifyingKey,
        now: u32,
    ) -> Result<(u32, ResolverIdentity)> {
        if cert.len() != CERT_LEN {
            return Err(DnsError::DnsCrypt(format!("bad certificate length {}", cert.len())));
        }
        if cert[0..4] != CERT_MAGIC {
            return Err(DnsError::DnsCrypt("bad certificate magic".into()));
        }
        let es_version = u16::from_be_bytes([cert[4], cert[5]]);
        let signature = Signature::from_bytes(cert[8..72].try_into().unwrap());
        verifying_key
            .verify_strict(&cert[72..], &signature)
            .map_err(|_| DnsError::DnsCrypt("bad certificate signature".into()))?;

        let resolver_pk: [u8; 32] = cert[72..104].try_into().unwrap();
        let client_magic: [u8; 8] = cert[104..112].try_into().unwrap();
        let serial = u32::from_be_bytes(cert[112..116].try_into().unwrap());
        let ts_start = u32::from_be_bytes(cert[116..120].try_into().unwrap());
        let ts_end = u32::from_be_bytes(cert[120..124].try_into().unwrap());
        if now < ts_start || now > ts_end {
            return Err(DnsError::DnsCrypt("certificate not currently valid".into()));
        }

        let resolver_pk = PublicKey::from(resolver_pk);
        let cipher = match es_version {
            ES_XSALSA20 => Cipher::XSalsa20(Box::new(SalsaBox::new(&resolver_pk, &self.client_secret))),
            ES_XCHACHA20 => {
                Cipher::XChaCha20(Box::new(ChaChaBox::new(&resolver_pk, &self.client_secret)))
            }
            other => {
                return Err(DnsError::DnsCrypt(format!("unsupported es-version {}", other)));
            }
        };
        Ok((serial, ResolverIdentity { cipher, client_magic }))
    }

    fn seal_query(&self, identity: &ResolverIdentity, encoded: &[u8]) -> Result<(Vec<u8>, [u8; 12])> {
        let mut client_nonce = [0u8; 12];
        rand::rng().fill_bytes(&mut client_nonce);
        let mut nonce = [0u8; 24];
        nonce[..12].copy_from_slice(&client_nonce);

        let sealed = identity.cipher.seal(&nonce, &pad_query(encoded))?;

        let client_pk = self.client_secret.public_key();
        let mut packet =
            Vec::with_capacity(8 + 32 + 12 + sealed.len());
        packet.extend_from_slice(&identity.client_magic);
        packet.extend_from_slice(client_pk.as_bytes());
        packet.extend_from_slice(&client_nonce);
        packet.extend_from_slice(&sealed);
        Ok((packet, client_nonce))
    }

    fn open_response(
        &self,
        identity: &ResolverIdentity,
        raw: &[u8],
        client_nonce: &[u8; 12],
    ) -> Result<Message> {
        if raw.len() < 8 + 24 || raw[..8] != RESOLVER_MAGIC {
            return Err(DnsError::DnsCrypt("bad resolver magic".into()));
        }
        let nonce: [u8; 24] = raw[8..32].try_into().unwrap();
        if nonce[..12] != *client_nonce {
            return Err(DnsError::DnsCrypt("response nonce mismatch".into()));
        }
        let plain = identity.cipher.open(&nonce, &raw[32..])?;
        let unpadded = unpad_message(&plain)?;
        Message::from_vec(unpadded).map_err(|e| DnsError::Decode(e.to_string()))
    }

    async fn exchange_once(&self, encoded: &[u8], use_tcp: bool) -> Result<Message> {
        self.ensure_identity().await?;
        let identity_guard = self.identity.lock().await;
        let identity = identity_guard
            .as_ref()
            .ok_or_else(|| DnsError::DnsCrypt("no resolver identity".into()))?;

        let (packet, client_nonce) = self.seal_query(identity, encoded)?;
        let timeout = Some(self.options.timeout);

        let raw = if use_tcp {
            let mut flow = self.connector.connect_tcp(self.stamp.addr, self.options.outbound_interface.as_deref(), timeout).await?;
            flow.send_dns_packet(&packet).await?;
            flow.receive_dns_packet(timeout).await?
        } else {
            let mut flow = self.connector.connect_udp(self.stamp.addr, self.options.outbound_interface.as_deref(), timeout).await?;
            flow.send_dns_packet(&packet).await?;
            flow.receive_dns_packet(timeout).await?
        };

        self.open_response(identity, &raw, &client_nonce)
    }
}

#[async_trait]
impl Upstream for DnsCryptUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        let encoded = request
            .to_vec()
            .map_err(|e| DnsError::Encode(e.to_string()))?;

        let response = self.exchange_once(&encoded, false).await?;
        if response.truncated() {
            log::debug!(
                "[{}] sealed response truncated, retrying over TCP",
                self.options.address
            );
            return self.exchange_once(&encoded, true).await;
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

/// ISO/IEC 7816-4 padding to a 64-byte multiple, at least 256 bytes
fn pad_query(encoded: &[u8]) -> Vec<u8> {
    let unpadded = encoded.len() + 1;
    let padded_len = std::cmp::max(MIN_PADDED_LEN, unpadded.div_ceil(PAD_BLOCK) * PAD_BLOCK);
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(encoded);
    padded.push(0x80);
    padded.resize(padded_len, 0x00);
    padded
}

fn unpad_message(padded: &[u8]) -> Result<&[u8]> {
    let boundary = padded
        .iter()
        .rposition(|&b| b != 0x00)
        .ok_or_else(|| DnsError::DnsCrypt("all-zero padding".into()))?;
    if padded[boundary] != 0x80 {
        return Err(DnsError::DnsCrypt("bad padding terminator".into()));
    }
    Ok(&padded[..boundary])
}
