//! Bounded message queue with synchronous fallback (spec.md §4.4).

use crate::metrics::METRICS;
use crate::schema::{Address, SubscriptionEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub const QUEUE_CAPACITY: usize = 1000;
pub const WORKER_COUNT: usize = 4;

/// What a worker (or a synchronous-fallback caller) does with one
/// dequeued item. Implemented by whatever wires the aggregator to the
/// queue.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, address: Address, event: SubscriptionEvent);
}

pub struct MessageQueue {
    tx: mpsc::Sender<(Address, SubscriptionEvent)>,
    capacity: usize,
    handler: Arc<dyn EventHandler>,
}

impl MessageQueue {
    pub fn new(capacity: usize, handler: Arc<dyn EventHandler>) -> (Arc<Self>, mpsc::Receiver<(Address, SubscriptionEvent)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx,
                capacity,
                handler,
            }),
            rx,
        )
    }

    /// Enqueues one item, falling back to running the handler on the
    /// caller's own task when the queue is full — preserves liveness at
    /// the cost of pushing backpressure upstream to the socket reader.
    pub async fn enqueue(&self, address: Address, event: SubscriptionEvent) {
        match self.tx.try_send((address, event)) {
            Ok(()) => {
                let depth = self.capacity - self.tx.capacity();
                METRICS.queue_depth.set(depth as i64);
            }
            Err(TrySendError::Full((address, event))) => {
                METRICS.queue_synchronous_fallbacks.inc();
                self.handler.handle(address, event).await;
            }
            Err(TrySendError::Closed((address, event))) => {
                self.handler.handle(address, event).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(Arc<AtomicUsize>);
    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _address: Address, _event: SubscriptionEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr() -> Address {
        Address::new("0x1234567890123456789012345678901234567890").unwrap()
    }

    #[tokio::test]
    async fn full_queue_falls_back_to_synchronous_handling() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler(count.clone()));
        let (queue, _rx) = MessageQueue::new(1, handler);

        queue.enqueue(addr(), SubscriptionEvent::Control).await; // fills capacity-1 slot
        queue.enqueue(addr(), SubscriptionEvent::Control).await; // queue now full, falls back
        queue.enqueue(addr(), SubscriptionEvent::Control).await; // still full, falls back

        assert_eq!(count.load(Ordering::SeqCst), 2, "two of three enqueues should have run synchronously");
    }
}
