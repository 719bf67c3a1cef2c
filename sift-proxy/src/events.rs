//! Per-request observability events

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Everything the proxy learned while processing one request
#[derive(Debug, Clone, Default)]
pub struct DnsRequestProcessedEvent {
    /// Queried domain, with trailing dot
    pub domain: String,
    /// Query type name ("A", "AAAA", ...)
    pub query_type: String,
    /// Processing start, milliseconds since the epoch
    pub start_time: u64,
    /// Processing time, milliseconds
    pub elapsed: u64,
    /// RCODE name of the response ("NoError", "NXDomain", ...)
    pub status: String,
    /// Textual answer records of the delivered response
    pub answer: String,
    /// Textual answer records of the upstream response, when the delivered
    /// one was synthesized by filtering
    pub original_answer: String,
    /// Id of the upstream that produced the response
    pub upstream_id: Option<i32>,
    /// Bytes received from the client
    pub bytes_sent: usize,
    /// Bytes delivered back to the client
    pub bytes_received: usize,
    /// Texts of matched rules, most significant first
    pub rules: Vec<String>,
    /// Filter list ids of the matched rules, parallel to `rules`
    pub filter_list_ids: Vec<i32>,
    /// The decisive rule was an exception
    pub whitelist: bool,
    /// Error description; empty on success
    pub error: String,
    /// The response came from the cache
    pub cache_hit: bool,
    /// The upstream response carried RRSIG records
    pub dnssec: bool,
}

impl DnsRequestProcessedEvent {
    /// Create an event stamped with the current time
    pub fn start() -> Self {
        Self {
            start_time: now_millis(),
            ..Self::default()
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Server certificate chain offered to the application for verification
#[derive(Debug, Clone)]
pub struct CertificateVerificationEvent {
    /// DER-encoded leaf certificate
    pub certificate: Vec<u8>,
    /// DER-encoded intermediates, leaf excluded
    pub chain: Vec<Vec<u8>>,
}

pub type RequestProcessedCallback = Arc<dyn Fn(DnsRequestProcessedEvent) + Send + Sync>;

/// Returns `Err` with a reason to reject the certificate
pub type CertificateVerificationCallback =
    Arc<dyn Fn(&CertificateVerificationEvent) -> std::result::Result<(), String> + Send + Sync>;

/// Application callbacks; all of them are invoked outside internal locks and
/// may block
#[derive(Clone, Default)]
pub struct DnsProxyEvents {
    pub on_request_processed: Option<RequestProcessedCallback>,
    pub on_certificate_verification: Option<CertificateVerificationCallback>,
}

impl std::fmt::Debug for DnsProxyEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsProxyEvents")
            .field("on_request_processed", &self.on_request_processed.is_some())
            .field(
                "on_certificate_verification",
                &self.on_certificate_verification.is_some(),
            )
            .finish()
    }
}

impl DnsProxyEvents {
    /// Deliver a processed-request event; a panicking callback is contained
    pub(crate) fn fire_request_processed(&self, event: DnsRequestProcessedEvent) {
        if let Some(callback) = &self.on_request_processed {
            let callback = callback.clone();
            if catch_unwind(AssertUnwindSafe(move || callback(event))).is_err() {
                log::warn!("on_request_processed callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_fire_delivers_event() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let events = DnsProxyEvents {
            on_request_processed: Some(Arc::new(move |e| {
                sink.lock().unwrap().push(e.domain);
            })),
            on_certificate_verification: None,
        };
        let mut event = DnsRequestProcessedEvent::start();
        event.domain = "example.com.".into();
        events.fire_request_processed(event);
        assert_eq!(seen.lock().unwrap().as_slice(), ["example.com."]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let events = DnsProxyEvents {
            on_request_processed: Some(Arc::new(|_| panic!("application bug"))),
            on_certificate_verification: None,
        };
        events.fire_request_processed(DnsRequestProcessedEvent::start());
    }
}
