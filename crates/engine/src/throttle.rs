//! Request throttling for uploads. A leaky-bucket counter per
//! `(peer-uid, TTH, offset)`, 3600-second tick, burst of 10.
//!
//! `tthl` requests get their own key variant rather than sharing the file
//! variant through a magic offset value.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tigerwire_core::cid::Uid;
use tigerwire_core::tth::Tth;

const TICK: Duration = Duration::from_secs(3600);
const BURST: u32 = 10;

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ThrottleKey {
    File { uid: Uid, tth: Tth, offset: u64 },
    Tthl { uid: Uid, tth: Tth },
}

struct Bucket {
    /// Count of requests granted since `window_start`.
    count: u32,
    window_start: Instant,
}

/// Registry of leaky-bucket counters. Entries older than `TICK` are
/// considered stale and evicted lazily on next touch.
pub struct ThrottleTable {
    buckets: Mutex<HashMap<ThrottleKey, Bucket>>,
}

impl Default for ThrottleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleTable {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record one request for `key` and decide whether it is granted.
    /// Granted-slot peers must not call this at all — they are exempt.
    pub fn check(&self, key: ThrottleKey) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key).or_insert(Bucket {
            count: 0,
            window_start: now,
        });
        if now.duration_since(bucket.window_start) >= TICK {
            bucket.count = 0;
            bucket.window_start = now;
        }
        if bucket.count >= BURST {
            false
        } else {
            bucket.count += 1;
            true
        }
    }

    /// Drop entries whose window has fully expired; call this
    /// periodically, not on the request hot path.
    pub fn evict_stale(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, b| now.duration_since(b.window_start) < TICK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigerwire_core::cid::CID_LEN;
    use tigerwire_core::id::Id;

    #[test]
    fn eleventh_request_in_window_is_throttled() {
        let table = ThrottleTable::new();
        let key = ThrottleKey::File {
            uid: Uid(1),
            tth: Id::new([0u8; CID_LEN]),
            offset: 0,
        };
        for _ in 0..10 {
            assert!(table.check(key.clone()));
        }
        assert!(!table.check(key));
    }

    #[test]
    fn tthl_requests_use_their_own_key_variant_not_a_sentinel_offset() {
        let table = ThrottleTable::new();
        let uid = Uid(1);
        let tth: Tth = Id::new([0u8; CID_LEN]);
        let file_key = ThrottleKey::File { uid, tth, offset: 0 };
        let tthl_key = ThrottleKey::Tthl { uid, tth };
        for _ in 0..10 {
            assert!(table.check(file_key.clone()));
        }
        // A separate bucket: tthl traffic on the same file is unaffected.
        assert!(table.check(tthl_key));
    }
}
