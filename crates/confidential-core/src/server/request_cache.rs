//! Requests decoded during pre-validation, kept until ordered execution

use crate::codec::Request;
use crate::types::ProcessId;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Identity of a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub sender: ProcessId,
    pub session: u32,
    pub sequence: u32,
}

impl RequestKey {
    pub fn new(sender: ProcessId, session: u32, sequence: u32) -> Self {
        Self {
            sender,
            session,
            sequence,
        }
    }
}

struct CachedRequest {
    request: Request,
    inserted: u64,
    expires_at: DateTime<Utc>,
}

/// Bounded cache of provisionally validated requests.
///
/// Entries leave on consumption, on expiry, and oldest first once the
/// capacity is reached. Requests that never get ordered therefore cannot
/// accumulate.
pub struct RequestCache {
    entries: DashMap<RequestKey, CachedRequest>,
    capacity: usize,
    ttl: Duration,
    counter: AtomicU64,
}

impl RequestCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
            counter: AtomicU64::new(0),
        }
    }

    pub fn put(&self, key: RequestKey, request: Request) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.cleanup();
            while self.entries.len() >= self.capacity {
                if !self.evict_oldest() {
                    break;
                }
            }
        }
        let entry = CachedRequest {
            request,
            inserted: self.counter.fetch_add(1, Ordering::Relaxed),
            expires_at: Utc::now() + self.ttl,
        };
        self.entries.insert(key, entry);
    }

    /// Remove and return a live entry
    pub fn take(&self, key: &RequestKey) -> Option<Request> {
        let (_, entry) = self.entries.remove(key)?;
        if entry.expires_at <= Utc::now() {
            debug!(sender = key.sender, sequence = key.sequence, "Cached request expired");
            return None;
        }
        Some(entry.request)
    }

    /// Remove expired entries
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted)
            .map(|entry| *entry.key());
        match oldest {
            Some(key) => {
                debug!(sender = key.sender, sequence = key.sequence, "Evicting cached request");
                self.entries.remove(&key).is_some()
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(byte: u8) -> Request {
        Request::application(vec![byte])
    }

    #[test]
    fn test_take_consumes_entry() {
        let cache = RequestCache::new(4, Duration::seconds(60));
        let key = RequestKey::new(1, 0, 7);
        cache.put(key, request(1));

        assert_eq!(cache.take(&key), Some(request(1)));
        assert_eq!(cache.take(&key), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = RequestCache::new(4, Duration::zero());
        let key = RequestKey::new(1, 0, 1);
        cache.put(key, request(1));
        assert_eq!(cache.take(&key), None);

        cache.put(RequestKey::new(2, 0, 1), request(2));
        cache.cleanup();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = RequestCache::new(2, Duration::seconds(60));
        cache.put(RequestKey::new(1, 0, 1), request(1));
        cache.put(RequestKey::new(1, 0, 2), request(2));
        cache.put(RequestKey::new(1, 0, 3), request(3));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.take(&RequestKey::new(1, 0, 1)), None);
        assert_eq!(cache.take(&RequestKey::new(1, 0, 3)), Some(request(3)));
    }
}
