//! Concurrent map primitive and panic-recovering task spawner.
//!
//! Every cache in this crate (dedup, symbol map, price, position,
//! pending-order) is built on top of `ConcurrentMap`: a thin wrapper
//! over `DashMap` that tracks a live count with an `AtomicUsize` so
//! readers never block writers (spec.md §5).

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ConcurrentMap<K, V> {
    inner: DashMap<K, V>,
    size: AtomicUsize,
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let prev = self.inner.insert(key, value);
        if prev.is_none() {
            self.size.fetch_add(1, Ordering::Relaxed);
        }
        prev
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.inner.remove(key);
        if removed.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        removed.map(|(_, v)| v)
    }

    pub fn get(&self, key: &K) -> Option<dashmap::mapref::one::Ref<'_, K, V>> {
        self.inner.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Inserts `make()` only if `key` is absent, returning a reference
    /// to whichever value now occupies the slot — the at-most-one-entry
    /// guarantee the aggregator's `pendingOrders.LoadOrStore` relies on.
    pub fn load_or_store(&self, key: K, make: impl FnOnce() -> V) -> dashmap::mapref::one::Ref<'_, K, V> {
        if !self.inner.contains_key(&key) {
            if let dashmap::mapref::entry::Entry::Vacant(e) = self.inner.entry(key.clone()) {
                e.insert(make());
                self.size.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.inner.get(&key).expect("just inserted or already present")
    }

    pub fn iter(&self) -> dashmap::iter::Iter<'_, K, V> {
        self.inner.iter()
    }

    pub fn retain(&self, mut f: impl FnMut(&K, &mut V) -> bool) {
        let before = self.inner.len();
        self.inner.retain(|k, v| f(k, v));
        let removed = before.saturating_sub(self.inner.len());
        if removed > 0 {
            self.size.fetch_sub(removed, Ordering::Relaxed);
        }
    }
}

/// Spawns `make_fut` under a cancellation-aware supervisor: if the task
/// panics, it is logged and restarted exactly once; a second panic is
/// given up on (spec.md §7: "the task is restarted once, then given up").
/// Returns the outer join handle so callers can still wait for the
/// supervisor (and therefore the task, restarts included) to finish.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    make_fut: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let make_fut = Arc::new(make_fut);
    tokio::spawn(async move {
        for attempt in 0..2u32 {
            if cancel.is_cancelled() {
                return;
            }
            let fut = (make_fut)();
            let result = tokio::spawn(fut).await;
            match result {
                Ok(()) => return,
                Err(join_err) if join_err.is_cancelled() => return,
                Err(join_err) => {
                    tracing::error!(task = name, attempt, error = %join_err, "task panicked");
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    tracing::error!(task = name, "task panicked twice, giving up");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_size_on_insert_remove() {
        let map: ConcurrentMap<String, i32> = ConcurrentMap::new();
        assert_eq!(map.len(), 0);
        map.insert("a".to_string(), 1);
        map.insert("b".to_string(), 2);
        assert_eq!(map.len(), 2);
        map.insert("a".to_string(), 10); // overwrite, not a new key
        assert_eq!(map.len(), 2);
        map.remove(&"a".to_string());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn load_or_store_is_at_most_once() {
        let map: ConcurrentMap<&str, Vec<i32>> = ConcurrentMap::new();
        map.load_or_store("k", Vec::new);
        map.load_or_store("k", || vec![99]); // must not overwrite
        assert!(map.get(&"k").unwrap().is_empty());
    }

    #[tokio::test]
    async fn supervised_task_restarts_once_then_gives_up() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let c = counter.clone();
        spawn_supervised("flaky", cancel.clone(), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
