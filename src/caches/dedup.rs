//! TTL-indexed dedup cache.
//!
//! Keys are the three-part `"{address}-{oid}-{direction}"` string
//! spec.md §3/§9 settles on (the Open Question about the dedup key
//! vs. the ORM upsert key is resolved by keeping both three-part).
//! A 30 minute TTL bounds memory; on startup the set is rehydrated
//! from the store so a freshly restarted process doesn't immediately
//! re-emit a signal it already persisted.

use crate::concurrent::ConcurrentMap;
use crate::error::Result;
use crate::schema::{Address, Direction};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

pub fn dedup_key(address: &Address, oid: i64, direction: Direction) -> String {
    let dir = match direction {
        Direction::Open => "open",
        Direction::Close => "close",
    };
    format!("{address}-{oid}-{dir}")
}

/// Capability the dedup cache needs from the store to rehydrate after
/// a restart — a typed substitute for the source's empty-interface DAO
/// injection (spec.md §9).
#[async_trait]
pub trait SignalHistorySource: Send + Sync {
    /// Returns `(address, oid, direction, last_fill_time_ms)` for every
    /// signal whose `last_fill_time >= since_ms`.
    async fn get_sent_orders_since(&self, since_ms: i64) -> Result<Vec<(Address, i64, Direction, i64)>>;
}

pub struct DedupCache {
    entries: ConcurrentMap<String, i64>, // key -> expiry (unix ms)
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: ConcurrentMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point lookup. Lazily treats an expired entry as absent.
    pub fn is_seen(&self, key: &str) -> bool {
        match self.entries.get(&key.to_string()) {
            Some(expiry) => *expiry > crate::util::now_ms(),
            None => false,
        }
    }

    /// Marks `key` seen with the default TTL.
    pub fn mark(&self, key: &str) {
        let expiry = crate::util::now_ms() + self.ttl.as_millis() as i64;
        self.entries.insert(key.to_string(), expiry);
    }

    /// Drops expired entries. Intended to be called periodically by a
    /// background sweep so the map doesn't grow unbounded between hits.
    pub fn sweep_expired(&self) {
        let now = crate::util::now_ms();
        self.entries.retain(|_, expiry| *expiry > now);
    }

    /// Pre-populates the set from signals emitted within `window` of
    /// now, per spec.md §4.6.
    pub async fn load_from_db(&self, source: &dyn SignalHistorySource, window: Duration) -> Result<usize> {
        let since = crate::util::now_ms() - window.as_millis() as i64;
        let rows = source.get_sent_orders_since(since).await?;
        let count = rows.len();
        for (address, oid, direction, _last_fill_time) in rows {
            self.mark(&dedup_key(&address, oid, direction));
        }
        Ok(count)
    }
}

/// Background sweep loop, run once per TTL/4 to keep memory bounded
/// without a per-access expiry scan.
pub async fn run_sweeper(cache: std::sync::Arc<DedupCache>, cancel: CancellationToken) {
    let interval = cache.ttl / 4;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                cache.sweep_expired();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FakeSource(Vec<(Address, i64, Direction, i64)>);

    #[async_trait]
    impl SignalHistorySource for FakeSource {
        async fn get_sent_orders_since(&self, _since_ms: i64) -> Result<Vec<(Address, i64, Direction, i64)>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn key_is_three_part() {
        let addr = Address::new("0x1234567890123456789012345678901234567890").unwrap();
        assert_eq!(dedup_key(&addr, 7, Direction::Open), format!("{addr}-7-open"));
        assert_eq!(dedup_key(&addr, 7, Direction::Close), format!("{addr}-7-close"));
    }

    #[test]
    fn mark_then_seen() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(!cache.is_seen("k"));
        cache.mark("k");
        assert!(cache.is_seen("k"));
    }

    #[test]
    fn expired_entries_read_as_unseen() {
        let cache = DedupCache::new(Duration::from_millis(0));
        cache.mark("k");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.is_seen("k"));
    }

    #[tokio::test]
    async fn load_from_db_rehydrates_keys() {
        let addr = Address::new("0x1234567890123456789012345678901234567890").unwrap();
        let source = FakeSource(vec![(addr.clone(), 1, Direction::Open, crate::util::now_ms())]);
        let cache = DedupCache::new(Duration::from_secs(60));
        let n = cache.load_from_db(&source, Duration::from_secs(1800)).await.unwrap();
        assert_eq!(n, 1);
        assert!(cache.is_seen(&dedup_key(&addr, 1, Direction::Open)));
    }
}
