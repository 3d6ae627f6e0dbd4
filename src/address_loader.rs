//! Periodically diffs the watched-address set against the pool's live
//! subscriptions (spec.md §4.7).

use crate::persistence::AddressRepository;
use crate::pool::ConnectionPool;
use crate::schema::Address;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct AddressLoader {
    repo: Arc<dyn AddressRepository>,
    pool: Arc<ConnectionPool>,
    known: std::sync::Mutex<HashSet<Address>>,
    /// Single-flight guard: a reload already in flight skips a new one
    /// rather than overlapping (spec.md §4.7).
    in_flight: AtomicBool,
}

impl AddressLoader {
    pub fn new(repo: Arc<dyn AddressRepository>, pool: Arc<ConnectionPool>) -> Arc<Self> {
        Arc::new(Self {
            repo,
            pool,
            known: std::sync::Mutex::new(HashSet::new()),
            in_flight: AtomicBool::new(false),
        })
    }

    pub async fn reload_once(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("address reload already in flight, skipping this tick");
            return;
        }

        let result = self.repo.list_distinct_addresses().await;
        self.in_flight.store(false, Ordering::SeqCst);

        let fresh: HashSet<Address> = match result {
            Ok(rows) => rows.into_iter().map(|w| w.address).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "address reload failed, keeping previous set");
                return;
            }
        };

        let mut known = self.known.lock().expect("lock not poisoned");

        let additions: Vec<Address> = fresh.difference(&known).cloned().collect();
        let removals: Vec<Address> = known.difference(&fresh).cloned().collect();

        for addr in &removals {
            self.pool.unsubscribe(addr);
        }

        // An address whose subscribe fails with CapacityExhausted is
        // skipped for this tick rather than recorded as known, so the
        // next reload retries it (spec.md §7).
        let mut subscribed = Vec::with_capacity(additions.len());
        let mut skipped = 0usize;
        for addr in &additions {
            match self.pool.subscribe(addr.clone()).await {
                Ok(()) => subscribed.push(addr.clone()),
                Err(e) => {
                    tracing::warn!(address = %addr, error = %e, "skipping address this cycle");
                    skipped += 1;
                }
            }
        }

        if !subscribed.is_empty() || !removals.is_empty() {
            tracing::info!(added = subscribed.len(), removed = removals.len(), skipped, "address set changed");
        }

        let mut settled = fresh;
        for addr in &additions {
            if !subscribed.contains(addr) {
                settled.remove(addr);
            }
        }
        *known = settled;
    }

    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        self.reload_once().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    self.reload_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::schema::SubscriptionEvent;
    use crate::schema::WatchedAddress;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeRepo(Mutex<Vec<Address>>);
    #[async_trait]
    impl AddressRepository for FakeRepo {
        async fn list_distinct_addresses(&self) -> Result<Vec<WatchedAddress>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .enumerate()
                .map(|(i, a)| WatchedAddress { id: i as i64, player_id: None, address: a.clone() })
                .collect())
        }
    }

    fn addr(n: u8) -> Address {
        Address::new(format!("0x{:040x}", n)).unwrap()
    }

    #[tokio::test]
    async fn reload_subscribes_additions_and_unsubscribes_removals() {
        let cancel = CancellationToken::new();
        let on_event: Arc<dyn Fn(Address, SubscriptionEvent) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync> =
            Arc::new(|_, _| Box::pin(async {}));
        let pool = ConnectionPool::new("ws://127.0.0.1:1".to_string(), 4, 10, on_event, cancel.clone());

        let repo_concrete = Arc::new(FakeRepo(Mutex::new(vec![addr(1), addr(2)])));
        let repo: Arc<dyn AddressRepository> = repo_concrete.clone();
        let loader = AddressLoader::new(repo, pool.clone());

        loader.reload_once().await;
        assert!(pool.is_subscribed(&addr(1)));
        assert!(pool.is_subscribed(&addr(2)));

        *repo_concrete.0.lock().unwrap() = vec![addr(2)];

        loader.reload_once().await;
        assert!(!pool.is_subscribed(&addr(1)));
        assert!(pool.is_subscribed(&addr(2)));

        cancel.cancel();
    }
}
