//! Response cache with expired-but-servable semantics
//!
//! A bounded LRU mapping from the normalized question to the cached response.
//! Unlike a plain TTL cache, lookups distinguish hit-fresh from hit-expired:
//! the forwarder serves expired entries when optimistic caching is on and
//! refreshes them in the background.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, Query, ResponseCode};
use lru::LruCache;

/// Fallback capacity when settings carry zero
pub const DEFAULT_CAPACITY: usize = 1000;

/// TTL used for negative responses without records
const NEGATIVE_TTL_SECS: u64 = 60;

/// Cache key: lowercased question name, type and class.
/// EDNS client data and the DO bit are deliberately not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    rr_type: u16,
    rr_class: u16,
}

impl CacheKey {
    fn from_query(query: &Query) -> Self {
        Self {
            name: query.name().to_string().to_lowercase(),
            rr_type: query.query_type().into(),
            rr_class: query.query_class().into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: Message,
    inserted_at: Instant,
    ttl: Duration,
    upstream_id: Option<i32>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Result of a cache probe
#[derive(Debug, Default)]
pub struct CacheResult {
    /// The cached response with TTLs decremented and the id patched to the
    /// request's; `None` on miss
    pub response: Option<Message>,
    /// The entry outlived its TTL; with optimistic caching disabled the
    /// caller must treat this as a miss
    pub expired: bool,
    /// Id of the upstream the entry came from
    pub upstream_id: Option<i32>,
}

/// Bounded TTL-aware response cache
pub struct ResponseCache {
    cache: LruCache<CacheKey, CacheEntry>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Look up the response for `request`
    pub fn get(&mut self, request: &Message) -> CacheResult {
        let Some(query) = request.queries().first() else {
            return CacheResult::default();
        };
        let key = CacheKey::from_query(query);
        let now = Instant::now();

        let Some(entry) = self.cache.get(&key) else {
            return CacheResult::default();
        };

        let mut response = entry.response.clone();
        response.set_id(request.id());
        let elapsed_secs = now.duration_since(entry.inserted_at).as_secs() as u32;
        for record in response.answers_mut().iter_mut() {
            record.set_ttl(record.ttl().saturating_sub(elapsed_secs));
        }
        for record in response.name_servers_mut().iter_mut() {
            record.set_ttl(record.ttl().saturating_sub(elapsed_secs));
        }

        CacheResult {
            expired: entry.is_expired(now),
            upstream_id: entry.upstream_id,
            response: Some(response),
        }
    }

    /// Store a response under the request's question
    ///
    /// Responses with no usable TTL, a zero TTL, or a non-cacheable RCODE are
    /// not stored. Failed exchanges never reach this point.
    pub fn put(&mut self, request: &Message, response: Message, upstream_id: Option<i32>) {
        let Some(query) = request.queries().first() else {
            return;
        };
        match response.response_code() {
            ResponseCode::NoError | ResponseCode::NXDomain => {}
            _ => return,
        }
        let Some(ttl_secs) = response_ttl(&response) else {
            return;
        };
        if ttl_secs == 0 {
            return;
        }

        let key = CacheKey::from_query(query);
        self.cache.put(
            key,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
                ttl: Duration::from_secs(ttl_secs),
                upstream_id,
            },
        );
    }

    /// Remove the entry for `request`, if any
    pub fn erase(&mut self, request: &Message) {
        if let Some(query) = request.queries().first() {
            self.cache.pop(&CacheKey::from_query(query));
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Effective TTL of a response: the minimum over its records, with a small
/// default for record-less negative responses
fn response_ttl(response: &Message) -> Option<u64> {
    let mut min_ttl: Option<u64> = None;
    for record in response.answers().iter().chain(response.name_servers().iter()) {
        let ttl = record.ttl() as u64;
        min_ttl = Some(min_ttl.map_or(ttl, |m| m.min(ttl)));
    }
    if min_ttl.is_none() && response.response_code() == ResponseCode::NXDomain {
        min_ttl = Some(NEGATIVE_TTL_SECS);
    }
    min_ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    fn make_request(name: &str, id: u16) -> Message {
        let mut message = Message::new();
        message.set_id(id);
        message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        message
    }

    fn make_response(request: &Message, ttl: u32) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.add_query(request.queries()[0].clone());
        let name = request.queries()[0].name().clone();
        response.add_answer(Record::from_rdata(
            name,
            ttl,
            RData::A(A(std::net::Ipv4Addr::new(93, 184, 216, 34))),
        ));
        response
    }

    #[test]
    fn test_round_trip_is_fresh() {
        let mut cache = ResponseCache::new(16);
        let request = make_request("example.com.", 0x1234);
        cache.put(&request, make_response(&request, 30), Some(7));

        let hit = cache.get(&request);
        assert!(!hit.expired);
        assert_eq!(hit.upstream_id, Some(7));
        let response = hit.response.unwrap();
        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.answers().len(), 1);
    }

    #[test]
    fn test_id_patched_to_request() {
        let mut cache = ResponseCache::new(16);
        let request = make_request("example.com.", 1);
        cache.put(&request, make_response(&request, 30), None);

        let second = make_request("example.com.", 0xbeef);
        let hit = cache.get(&second);
        assert_eq!(hit.response.unwrap().id(), 0xbeef);
    }

    #[test]
    fn test_key_is_case_insensitive() {
        let mut cache = ResponseCache::new(16);
        let request = make_request("Example.COM.", 1);
        cache.put(&request, make_response(&request, 30), None);
        assert!(cache.get(&make_request("example.com.", 2)).response.is_some());
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let mut cache = ResponseCache::new(16);
        let request = make_request("example.com.", 1);
        cache.put(&request, make_response(&request, 1), Some(3));

        std::thread::sleep(Duration::from_millis(1100));
        let hit = cache.get(&request);
        assert!(hit.expired);
        // The expired value is still handed out; optimistic policy decides.
        assert!(hit.response.is_some());
        assert_eq!(hit.upstream_id, Some(3));
    }

    #[test]
    fn test_served_ttl_is_decremented() {
        let mut cache = ResponseCache::new(16);
        let request = make_request("example.com.", 1);
        cache.put(&request, make_response(&request, 30), None);

        std::thread::sleep(Duration::from_millis(1100));
        let hit = cache.get(&request);
        assert_eq!(hit.response.unwrap().answers()[0].ttl(), 29);
    }

    #[test]
    fn test_zero_ttl_not_cached() {
        let mut cache = ResponseCache::new(16);
        let request = make_request("example.com.", 1);
        cache.put(&request, make_response(&request, 0), None);
        assert!(cache.get(&request).response.is_none());
    }

    #[test]
    fn test_refused_not_cached() {
        let mut cache = ResponseCache::new(16);
        let request = make_request("example.com.", 1);
        let mut response = make_response(&request, 30);
        response.set_response_code(ResponseCode::Refused);
        cache.put(&request, response, None);
        assert!(cache.get(&request).response.is_none());
    }

    #[test]
    fn test_lru_eviction_is_bounded() {
        let mut cache = ResponseCache::new(2);
        for (i, name) in ["one.com.", "two.com.", "three.com."].iter().enumerate() {
            let request = make_request(name, i as u16);
            cache.put(&request, make_response(&request, 30), None);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&make_request("one.com.", 9)).response.is_none());
        assert!(cache.get(&make_request("three.com.", 9)).response.is_some());
    }

    #[test]
    fn test_erase_removes_entry() {
        let mut cache = ResponseCache::new(16);
        let request = make_request("example.com.", 1);
        cache.put(&request, make_response(&request, 30), None);
        cache.erase(&request);
        assert!(cache.get(&request).response.is_none());
    }
}
