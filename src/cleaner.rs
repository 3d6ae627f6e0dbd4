//! Periodic deletion of aggregation and signal rows past the retention
//! window (spec.md §3: "kept for the retention window (2 h)").

use crate::error::{MonitorError, Result};
use crate::metrics::METRICS;
use crate::persistence::Database;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const RETENTION_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[async_trait]
pub trait RetentionSweeper: Send + Sync {
    /// Deletes rows older than `cutoff_ms` from both retained tables,
    /// returning the number of rows removed.
    async fn delete_expired(&self, cutoff_ms: i64) -> Result<u64>;
}

#[async_trait]
impl RetentionSweeper for Database {
    async fn delete_expired(&self, cutoff_ms: i64) -> Result<u64> {
        let cutoff = chrono::DateTime::from_timestamp_millis(cutoff_ms).unwrap_or_else(chrono::Utc::now);

        let agg = sqlx::query("DELETE FROM order_aggregation WHERE signal_sent = 1 AND updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| MonitorError::Transient(format!("cleaner delete order_aggregation failed: {e}")))?;

        let sig = sqlx::query("DELETE FROM address_signal WHERE expired_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| MonitorError::Transient(format!("cleaner delete address_signal failed: {e}")))?;

        Ok(agg.rows_affected() + sig.rows_affected())
    }
}

pub async fn run(sweeper: Arc<dyn RetentionSweeper>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                let cutoff_ms = crate::util::now_ms() - RETENTION_WINDOW.as_millis() as i64;
                match sweeper.delete_expired(cutoff_ms).await {
                    Ok(n) => {
                        if n > 0 {
                            METRICS.cleaner_rows_deleted.inc_by(n);
                            tracing::info!(rows = n, "cleaner removed expired rows");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "cleaner sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeSweeper(Arc<AtomicU64>);
    #[async_trait]
    impl RetentionSweeper for FakeSweeper {
        async fn delete_expired(&self, _cutoff_ms: i64) -> Result<u64> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn sweep_runs_until_cancelled() {
        let calls = Arc::new(AtomicU64::new(0));
        let sweeper: Arc<dyn RetentionSweeper> = Arc::new(FakeSweeper(calls.clone()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(sweeper, Duration::from_millis(5), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
