//! Short-lived memory of terminal order statuses, used to rescue a fill
//! that arrives after its status transition (spec.md §4.2).

use crate::concurrent::ConcurrentMap;
use crate::schema::{Address, OrderStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

pub struct StatusTracker {
    entries: ConcurrentMap<(Address, i64), (OrderStatus, i64)>,
    ttl: Duration,
}

impl StatusTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: ConcurrentMap::new(),
            ttl,
        }
    }

    /// Records a terminal status observation. Non-terminal statuses are
    /// not worth tracking — they carry no rescue value.
    pub fn observe(&self, address: &Address, oid: i64, status: OrderStatus) {
        if !status.is_terminal() {
            return;
        }
        let expiry = crate::util::now_ms() + self.ttl.as_millis() as i64;
        self.entries.insert((address.clone(), oid), (status, expiry));
    }

    /// Returns the terminal status observed for `(address, oid)` if one
    /// is still within its TTL window.
    pub fn terminal_for(&self, address: &Address, oid: i64) -> Option<OrderStatus> {
        self.entries.get(&(address.clone(), oid)).and_then(|v| {
            let (status, expiry) = *v;
            (expiry > crate::util::now_ms()).then_some(status)
        })
    }

    pub fn sweep_expired(&self) {
        let now = crate::util::now_ms();
        self.entries.retain(|_, (_, expiry)| *expiry > now);
    }
}

pub async fn run_sweeper(tracker: Arc<StatusTracker>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(tracker.ttl / 2) => {
                tracker.sweep_expired();
            }
        }
    }
}
