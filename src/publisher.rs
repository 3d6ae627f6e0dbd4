//! Downstream message bus boundary (spec.md §6): one publish per
//! signal, subject `hl.address.signal`, 2 s ack timeout.

use crate::error::{MonitorError, Result};
use crate::schema::Signal;
use async_trait::async_trait;
use std::time::Duration;

pub const SIGNAL_SUBJECT: &str = "hl.address.signal";
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, signal: &Signal) -> Result<()>;
}

pub struct NatsPublisher {
    client: async_nats::Client,
}

impl NatsPublisher {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let client = async_nats::connect(endpoint)
            .await
            .map_err(|e| MonitorError::Fatal(format!("nats connect failed: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, signal: &Signal) -> Result<()> {
        let payload = serde_json::to_vec(signal)
            .map_err(|e| MonitorError::Transient(format!("signal serialize failed: {e}")))?;

        tokio::time::timeout(ACK_TIMEOUT, self.client.publish(SIGNAL_SUBJECT, payload.into()))
            .await
            .map_err(|_| MonitorError::Transient("nats publish ack timed out".to_string()))?
            .map_err(|e| MonitorError::Transient(format!("nats publish failed: {e}")))?;

        tokio::time::timeout(ACK_TIMEOUT, self.client.flush())
            .await
            .map_err(|_| MonitorError::Transient("nats flush timed out".to_string()))?
            .map_err(|e| MonitorError::Transient(format!("nats flush failed: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AssetType, Direction, Side};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingPublisher(Arc<AtomicUsize>);
    #[async_trait]
    impl Publisher for CountingPublisher {
        async fn publish(&self, _signal: &Signal) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn signal() -> Signal {
        Signal {
            address: crate::schema::Address::new("0x1234567890123456789012345678901234567890").unwrap(),
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
    async fn publisher_trait_object_is_callable() {
        let count = Arc::new(AtomicUsize::new(0));
        let publisher: Arc<dyn Publisher> = Arc::new(CountingPublisher(count.clone()));
        publisher.publish(&signal()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
