//! Composes the bus publish and the persistence enqueue into the single
//! retried unit the aggregator's dual-trigger flush expects
//! (spec.md §4.3: "the emitter retries publish+persist").

use crate::aggregator::SignalSink;
use crate::batch_writer::BatchWriter;
use crate::error::Result;
use crate::publisher::Publisher;
use crate::schema::Signal;
use async_trait::async_trait;
use std::sync::Arc;

pub struct PersistingSink {
    publisher: Arc<dyn Publisher>,
    batch_writer: Arc<BatchWriter<Signal>>,
}

impl PersistingSink {
    pub fn new(publisher: Arc<dyn Publisher>, batch_writer: Arc<BatchWriter<Signal>>) -> Self {
        Self {
            publisher,
            batch_writer,
        }
    }
}

#[async_trait]
impl SignalSink for PersistingSink {
    async fn emit(&self, signal: &Signal) -> Result<()> {
        self.publisher.publish(signal).await?;
        self.batch_writer.add(signal.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Address, AssetType, Direction, Side};
    use crate::batch_writer::Upserter;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OkPublisher(Arc<AtomicUsize>);
    #[async_trait]
    impl Publisher for OkPublisher {
        async fn publish(&self, _signal: &Signal) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NoopUpserter;
    #[async_trait]
    impl Upserter<Signal> for NoopUpserter {
        async fn upsert_many(&self, _rows: Vec<Signal>) -> Result<()> {
            Ok(())
        }
    }

    fn signal() -> Signal {
        Signal {
            address: Address::new("0x1234567890123456789012345678901234567890").unwrap(),
            oid: 1,
            symbol: "BTC".to_string(),
            asset_type: AssetType::Perp,
            direction: Direction::Open,
            side: Side::Long,
            price: Decimal::ONE,
            size: Decimal::ONE,
            position_rate: Decimal::ZERO,
            close_rate: Decimal::ZERO,
            expired_at: 0,
        }
    }

    #[tokio::test]
    async fn emit_publishes_and_buffers_for_persistence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let publisher: Arc<dyn Publisher> = Arc::new(OkPublisher(calls.clone()));
        let writer = BatchWriter::new(Arc::new(NoopUpserter), 100, std::time::Duration::from_secs(3600));
        let sink = PersistingSink::new(publisher, writer.clone());

        sink.emit(&signal()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(writer.len(), 1);
    }
}
