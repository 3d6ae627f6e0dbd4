//! Connection pool: placement policy, subscription coalescing, and
//! relocation on connection failure (spec.md §4.1).
//!
//! Grounded on the teacher's `MasterPool` (random-pick-then-retry over
//! a fixed set of senders, `src/master_sender.rs`) generalized to a
//! dynamic pool that grows connections under a cap and relocates
//! subscriptions instead of just retrying a fixed roster.

pub mod connection;

use crate::error::{MonitorError, Result};
use crate::metrics::METRICS;
use crate::schema::{Address, SubscriptionEvent};
use connection::{spawn_connection, ConnectionHandle, ConnectionId};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use connection::ConnectionState;

pub struct ConnectionPool {
    ws_url: String,
    /// Hot-reloadable via `set_limits`, so a config change applies to
    /// placement decisions without restarting the pool.
    max_connections: AtomicUsize,
    max_subscriptions_per_connection: AtomicUsize,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
    /// Process-wide map of address -> owning connection, the single
    /// source of truth that makes concurrent `subscribe(addr)` calls
    /// for the same address coalesce into one wire subscription.
    subscriptions: DashMap<Address, ConnectionId>,
    /// Guards only the placement decision (pick-or-create connection),
    /// not the connections themselves — spec.md §4.1 "a single mutex
    /// guards placement, nothing else."
    placement_lock: Mutex<()>,
    on_event: Arc<dyn Fn(Address, SubscriptionEvent) -> BoxFuture<'static, ()> + Send + Sync>,
    cancel: CancellationToken,
}

impl ConnectionPool {
    pub fn new(
        ws_url: String,
        max_connections: usize,
        max_subscriptions_per_connection: usize,
        on_event: Arc<dyn Fn(Address, SubscriptionEvent) -> BoxFuture<'static, ()> + Send + Sync>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            ws_url,
            max_connections: AtomicUsize::new(max_connections),
            max_subscriptions_per_connection: AtomicUsize::new(max_subscriptions_per_connection),
            connections: DashMap::new(),
            next_id: AtomicU64::new(0),
            subscriptions: DashMap::new(),
            placement_lock: Mutex::new(()),
            on_event,
            cancel,
        })
    }

    /// Applies a config reload's limits to live placement decisions.
    pub fn set_limits(&self, max_connections: usize, max_subscriptions_per_connection: usize) {
        self.max_connections.store(max_connections, Ordering::Relaxed);
        self.max_subscriptions_per_connection
            .store(max_subscriptions_per_connection, Ordering::Relaxed);
    }

    /// Idempotent: subscribing an already-subscribed address is a no-op.
    ///
    /// Fails with `CapacityExhausted` when every connection is full and
    /// the pool is already at `max_connections` (spec.md §4.1/§7) —
    /// the caller (the address loader) skips the address and retries
    /// next cycle rather than overloading a connection past its cap.
    pub async fn subscribe(self: &Arc<Self>, address: Address) -> Result<()> {
        if self.subscriptions.contains_key(&address) {
            return Ok(());
        }

        let _guard = self.placement_lock.lock().await;
        // re-check under the lock: another task may have placed it
        // while we were waiting.
        if self.subscriptions.contains_key(&address) {
            return Ok(());
        }

        let handle = self.pick_or_create_connection().ok_or_else(|| {
            METRICS.subscribe_capacity_exhausted.inc();
            MonitorError::CapacityExhausted(format!(
                "no free slot for {address} at max_connections={}",
                self.max_connections.load(Ordering::Relaxed)
            ))
        })?;
        self.subscriptions.insert(address.clone(), handle.id);
        handle.subscribe(address);
        METRICS.subscriptions_active.set(self.subscriptions.len() as i64);
        Ok(())
    }

    pub fn unsubscribe(&self, address: &Address) {
        if let Some((_, conn_id)) = self.subscriptions.remove(address) {
            if let Some(handle) = self.connections.get(&conn_id) {
                handle.unsubscribe(address);
            }
            METRICS.subscriptions_active.set(self.subscriptions.len() as i64);
        }
    }

    pub fn is_subscribed(&self, address: &Address) -> bool {
        self.subscriptions.contains_key(address)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Smallest subscription count wins, ties broken by lowest id; a
    /// new connection is spun up only if every existing one is at
    /// capacity and the pool is under `max_connections`. Returns
    /// `None` when no connection has a free slot and the pool is
    /// already at `max_connections` — the caller turns that into
    /// `CapacityExhausted`.
    fn pick_or_create_connection(self: &Arc<Self>) -> Option<Arc<ConnectionHandle>> {
        let max_subs = self.max_subscriptions_per_connection.load(Ordering::Relaxed);
        let best = self
            .connections
            .iter()
            .filter(|e| e.value().subscription_count() < max_subs)
            .min_by_key(|e| (e.value().subscription_count(), *e.key()))
            .map(|e| e.value().clone());

        if let Some(handle) = best {
            return Some(handle);
        }

        if self.connections.len() < self.max_connections.load(Ordering::Relaxed) {
            return Some(self.spawn_new_connection());
        }

        None
    }

    fn spawn_new_connection(self: &Arc<Self>) -> Arc<ConnectionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pool = self.clone();
        let on_failed: Arc<dyn Fn(ConnectionId, Vec<Address>) + Send + Sync> =
            Arc::new(move |failed_id, addrs| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.relocate(failed_id, addrs).await });
            });

        let handle = spawn_connection(
            id,
            self.ws_url.clone(),
            self.on_event.clone(),
            on_failed,
            self.cancel.clone(),
        );
        self.connections.insert(id, handle.clone());
        handle
    }

    /// Called when a connection exhausts its backoff budget: every
    /// address it owned is re-subscribed through fresh placement.
    async fn relocate(self: Arc<Self>, failed_id: ConnectionId, addresses: Vec<Address>) {
        self.connections.remove(&failed_id);
        tracing::warn!(connection_id = failed_id, count = addresses.len(), "relocating subscriptions");
        for addr in addresses {
            self.subscriptions.remove(&addr);
            if let Err(e) = self.subscribe(addr.clone()).await {
                tracing::warn!(address = %addr, error = %e, "relocation failed, will retry next address reload");
            }
        }
    }

    /// Shuts down every connection and waits for subscriptions to clear.
    pub fn shutdown(&self) {
        for entry in self.connections.iter() {
            entry.value().shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::new(format!("0x{:040x}", n)).unwrap()
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_tracks_active_count() {
        let cancel = CancellationToken::new();
        let on_event: Arc<dyn Fn(Address, SubscriptionEvent) -> BoxFuture<'static, ()> + Send + Sync> =
            Arc::new(|_, _| Box::pin(async {}));
        // ws_url is unreachable in this unit test; we only exercise
        // placement bookkeeping, not the actual socket.
        let pool = ConnectionPool::new("ws://127.0.0.1:1".to_string(), 2, 2, on_event, cancel.clone());

        pool.subscribe(addr(1)).await.unwrap();
        assert!(pool.is_subscribed(&addr(1)));
        assert_eq!(pool.connection_count(), 1);

        pool.subscribe(addr(1)).await.unwrap();
        assert_eq!(pool.connection_count(), 1, "duplicate subscribe must not spawn a second connection");

        pool.unsubscribe(&addr(1));
        assert!(!pool.is_subscribed(&addr(1)));

        cancel.cancel();
    }

    #[tokio::test]
    async fn placement_spreads_across_connections_once_full() {
        let cancel = CancellationToken::new();
        let on_event: Arc<dyn Fn(Address, SubscriptionEvent) -> BoxFuture<'static, ()> + Send + Sync> =
            Arc::new(|_, _| Box::pin(async {}));
        let pool = ConnectionPool::new("ws://127.0.0.1:1".to_string(), 2, 1, on_event, cancel.clone());

        pool.subscribe(addr(1)).await.unwrap();
        pool.subscribe(addr(2)).await.unwrap();
        assert_eq!(pool.connection_count(), 2, "second address should overflow to a new connection once the first is full");

        cancel.cancel();
    }

    #[tokio::test]
    async fn subscribe_fails_with_capacity_exhausted_once_pool_is_full() {
        let cancel = CancellationToken::new();
        let on_event: Arc<dyn Fn(Address, SubscriptionEvent) -> BoxFuture<'static, ()> + Send + Sync> =
            Arc::new(|_, _| Box::pin(async {}));
        let pool = ConnectionPool::new("ws://127.0.0.1:1".to_string(), 1, 1, on_event, cancel.clone());

        pool.subscribe(addr(1)).await.unwrap();
        let err = pool.subscribe(addr(2)).await.unwrap_err();
        assert!(matches!(err, MonitorError::CapacityExhausted(_)));
        assert!(!pool.is_subscribed(&addr(2)));

        cancel.cancel();
    }
}
