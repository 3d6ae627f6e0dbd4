//! Generic coalescing batch writer: size/interval-triggered upsert
//! (spec.md §4.5).

use crate::error::Result;
use crate::metrics::METRICS;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Implemented by anything the batch writer can coalesce on — the same
/// role the source's `DedupKey() string` method plays, generalized to
/// an associated type instead of a string so keys aren't stringified
/// just to compare.
pub trait DedupKey {
    type Key: Eq + Hash + Clone + Send + Sync;
    fn dedup_key(&self) -> Self::Key;
}

/// Capability the writer needs from the store — a single multi-row
/// upsert over whatever's buffered.
#[async_trait::async_trait]
pub trait Upserter<T>: Send + Sync {
    async fn upsert_many(&self, rows: Vec<T>) -> Result<()>;
}

pub struct BatchWriter<T: DedupKey + Send + Sync + 'static> {
    buffer: DashMap<T::Key, T>,
    upserter: Arc<dyn Upserter<T>>,
    /// Hot-reloadable via `set_batch_size`/`set_flush_interval`, so a
    /// config change takes effect without restarting the flush loop.
    batch_size: AtomicUsize,
    flush_interval_ms: AtomicU64,
    /// Woken by `add()` once the buffer reaches `batch_size`, so the
    /// flush loop doesn't have to wait out the rest of the interval
    /// sleep for a burst that already hit the size trigger.
    size_trigger: Notify,
}

impl<T: DedupKey + Send + Sync + Clone + 'static> BatchWriter<T> {
    pub fn new(upserter: Arc<dyn Upserter<T>>, batch_size: usize, flush_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            buffer: DashMap::new(),
            upserter,
            batch_size: AtomicUsize::new(batch_size),
            flush_interval_ms: AtomicU64::new(flush_interval.as_millis() as u64),
            size_trigger: Notify::new(),
        })
    }

    pub fn set_batch_size(&self, batch_size: usize) {
        self.batch_size.store(batch_size, Ordering::Relaxed);
    }

    pub fn set_flush_interval(&self, interval: Duration) {
        self.flush_interval_ms.store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Adds or overwrites the buffered row for this item's key. Never
    /// blocks the flush loop longer than one map insert.
    pub fn add(&self, item: T) -> usize {
        self.buffer.insert(item.dedup_key(), item);
        let len = self.buffer.len();
        if len >= self.batch_size.load(Ordering::Relaxed) {
            self.size_trigger.notify_one();
        }
        len
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Snapshots and clears the buffer, then performs one upsert call.
    /// On failure the rows are dropped (best-effort, per spec.md §4.5) —
    /// the in-memory aggregation/position state that produced them is
    /// unaffected and will be retried on the next mutating event.
    pub async fn flush(&self) {
        if self.buffer.is_empty() {
            return;
        }
        let rows: Vec<T> = self.buffer.iter().map(|e| e.value().clone()).collect();
        self.buffer.clear();

        match self.upserter.upsert_many(rows).await {
            Ok(()) => METRICS.batch_flushes.inc(),
            Err(e) => {
                METRICS.batch_flush_errors.inc();
                tracing::warn!(error = %e, "batch upsert failed, rows dropped");
            }
        }
    }

    /// Flushes on whichever comes first: the buffer reaching
    /// `batch_size` or `flush_interval` elapsing (spec.md §4.5). Both
    /// knobs are re-read every iteration so a config reload applies to
    /// the very next tick.
    pub async fn run_flush_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = Duration::from_millis(self.flush_interval_ms.load(Ordering::Relaxed));
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush().await; // forced final flush on shutdown
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    self.flush().await;
                }
                _ = self.size_trigger.notified() => {
                    self.flush().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    struct Row {
        key: String,
        value: i32,
    }
    impl DedupKey for Row {
        type Key = String;
        fn dedup_key(&self) -> String {
            self.key.clone()
        }
    }

    struct RecordingUpserter {
        calls: AtomicUsize,
        seen: Mutex<Vec<Row>>,
    }
    #[async_trait::async_trait]
    impl Upserter<Row> for RecordingUpserter {
        async fn upsert_many(&self, rows: Vec<Row>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().extend(rows);
            Ok(())
        }
    }

    #[tokio::test]
    async fn coalesces_same_key_and_flushes_once() {
        let upserter = Arc::new(RecordingUpserter {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let writer = BatchWriter::new(upserter.clone(), 100, Duration::from_secs(2));

        writer.add(Row { key: "a".into(), value: 1 });
        writer.add(Row { key: "a".into(), value: 2 }); // overwrites
        assert_eq!(writer.len(), 1);

        writer.flush().await;
        assert_eq!(upserter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(upserter.seen.lock().unwrap().len(), 1);
        assert_eq!(upserter.seen.lock().unwrap()[0].value, 2);
        assert!(writer.is_empty());
    }

    #[tokio::test]
    async fn empty_flush_is_a_noop() {
        let upserter = Arc::new(RecordingUpserter {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let writer: Arc<BatchWriter<Row>> = BatchWriter::new(upserter.clone(), 100, Duration::from_secs(2));
        writer.flush().await;
        assert_eq!(upserter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hitting_batch_size_flushes_before_the_interval_elapses() {
        let upserter = Arc::new(RecordingUpserter {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let writer = BatchWriter::new(upserter.clone(), 2, Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let loop_handle = tokio::spawn(writer.clone().run_flush_loop(cancel.clone()));

        writer.add(Row { key: "a".into(), value: 1 });
        writer.add(Row { key: "b".into(), value: 2 }); // hits batch_size=2

        tokio::time::timeout(Duration::from_secs(1), async {
            while upserter.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("size-triggered flush should fire well before the 1h interval");

        assert_eq!(upserter.seen.lock().unwrap().len(), 2);

        cancel.cancel();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn lowering_batch_size_at_runtime_triggers_on_the_new_threshold() {
        let upserter = Arc::new(RecordingUpserter {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let writer = BatchWriter::new(upserter.clone(), 100, Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let loop_handle = tokio::spawn(writer.clone().run_flush_loop(cancel.clone()));

        writer.add(Row { key: "a".into(), value: 1 });
        assert_eq!(upserter.calls.load(Ordering::SeqCst), 0, "should not flush yet at batch_size=100");

        writer.set_batch_size(1);
        writer.add(Row { key: "b".into(), value: 2 }); // now over the new threshold

        tokio::time::timeout(Duration::from_secs(1), async {
            while upserter.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("reloaded batch_size should apply to the very next add()");

        cancel.cancel();
        loop_handle.await.unwrap();
    }
}
