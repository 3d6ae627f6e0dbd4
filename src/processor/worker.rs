//! Worker pool draining the message queue (spec.md §4.4).

use super::queue::EventHandler;
use crate::schema::{Address, SubscriptionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Spawns `worker_count` tasks sharing one receiver. Each loops:
/// recv → handle → repeat, until the channel closes or `cancel` fires.
pub fn spawn_workers(
    worker_count: usize,
    rx: mpsc::Receiver<(Address, SubscriptionEvent)>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..worker_count)
        .map(|id| {
            let rx = rx.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            msg = guard.recv() => msg,
                        }
                    };
                    match item {
                        Some((address, event)) => handler.handle(address, event).await,
                        None => break,
                    }
                }
                tracing::info!(worker = id, "worker exiting");
            })
        })
        .collect()
}

/// Waits for every worker to finish, up to `DRAIN_DEADLINE`. Workers
/// still running past the deadline are abandoned — shutdown has a hard
/// ceiling (spec.md §5).
pub async fn drain(handles: Vec<tokio::task::JoinHandle<()>>) {
    let joined = tokio::time::timeout(DRAIN_DEADLINE, futures_util::future::join_all(handles)).await;
    if joined.is_err() {
        tracing::warn!("worker drain deadline exceeded, proceeding with shutdown");
    }
}
