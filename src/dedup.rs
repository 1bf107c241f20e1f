//! Inbound message dedup.
//!
//! Providers redeliver: reconnect replays, webhook retries, multi-device
//! echoes. Admission suppresses a message seen twice within the TTL window,
//! keyed on `(provider, peer, messageId, sessionKey)`.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Capacity is deliberately generous so entries age out by TTL, not by
/// eviction pressure.
const CACHE_CAPACITY: usize = 2048;

/// Default suppression window.
pub const DEDUP_TTL: Duration = Duration::from_secs(60);

/// Identity of one inbound delivery.
#[derive(Debug, Clone)]
pub struct InboundKey<'a> {
    pub provider: &'a str,
    pub peer: &'a str,
    pub message_id: Option<&'a str>,
    pub session_key: Option<&'a str>,
}

pub struct InboundDedup {
    seen: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
    clock: Box<dyn Fn() -> Instant + Send + Sync>,
}

impl InboundDedup {
    pub fn new() -> Self {
        Self::with_clock(DEDUP_TTL, Box::new(Instant::now))
    }

    /// Injectable clock so tests control time.
    pub fn with_clock(ttl: Duration, clock: Box<dyn Fn() -> Instant + Send + Sync>) -> Self {
        Self {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
            ttl,
            clock,
        }
    }

    /// Returns true when this delivery is a replay within the TTL.
    ///
    /// First sight records the key. Deliveries without a `message_id` are
    /// never suppressed and never recorded.
    pub fn should_skip(&self, key: &InboundKey<'_>) -> bool {
        let Some(message_id) = key.message_id else {
            return false;
        };

        let dedup_key = format!(
            "{}|{}|{}|{}",
            key.provider,
            key.peer,
            message_id,
            key.session_key.unwrap_or("")
        );
        let now = (self.clock)();

        let mut seen = self.seen.lock();
        if let Some(&first_seen) = seen.get(&dedup_key) {
            if now.duration_since(first_seen) < self.ttl {
                return true;
            }
        }
        seen.put(dedup_key, now);
        false
    }
}
