//! Process-wide metrics registry.
//!
//! Grounded on the teacher's `metrics::METRICS` singleton (a
//! `once_cell::sync::Lazy<Arc<RuntimeMetrics>>` of plain counters),
//! generalized to the `prometheus` crate so `/metrics` can render the
//! standard text exposition format spec.md §6 requires instead of a
//! hand-rolled encoder.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,

    pub connections_active: IntGauge,
    pub ws_reconnects: IntCounter,
    pub connections_failed: IntCounter,
    pub subscriptions_active: IntGauge,
    pub subscribe_capacity_exhausted: IntCounter,

    pub queue_depth: IntGauge,
    pub queue_synchronous_fallbacks: IntCounter,
    pub events_processed: IntCounter,
    pub events_malformed: IntCounter,

    pub aggregations_open: IntGauge,
    pub signals_emitted: IntCounter,
    pub flush_retry_exhausted: IntCounter,

    pub batch_flushes: IntCounter,
    pub batch_flush_errors: IntCounter,

    pub dedup_hits: IntCounter,
    pub cleaner_rows_deleted: IntCounter,
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("valid metric definition")
}
fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("valid metric definition")
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let m = Metrics {
            connections_active: gauge("hlm_connections_active", "live websocket connections"),
            ws_reconnects: counter("hlm_ws_reconnects_total", "connection reconnect attempts"),
            connections_failed: counter("hlm_connections_failed_total", "connections that exhausted backoff"),
            subscriptions_active: gauge("hlm_subscriptions_active", "addresses currently subscribed"),
            subscribe_capacity_exhausted: counter(
                "hlm_subscribe_capacity_exhausted_total",
                "subscribe calls rejected for lack of capacity",
            ),
            queue_depth: gauge("hlm_queue_depth", "items currently buffered in the message queue"),
            queue_synchronous_fallbacks: counter(
                "hlm_queue_synchronous_fallbacks_total",
                "events processed synchronously because the queue was full",
            ),
            events_processed: counter("hlm_events_processed_total", "events handled by workers"),
            events_malformed: counter("hlm_events_malformed_total", "events dropped as malformed"),
            aggregations_open: gauge("hlm_aggregations_open", "pending order aggregations in memory"),
            signals_emitted: counter("hlm_signals_emitted_total", "signals published"),
            flush_retry_exhausted: counter(
                "hlm_flush_retry_exhausted_total",
                "aggregation flushes that exhausted their retry budget",
            ),
            batch_flushes: counter("hlm_batch_flushes_total", "batch writer flush cycles"),
            batch_flush_errors: counter("hlm_batch_flush_errors_total", "batch writer flush failures"),
            dedup_hits: counter("hlm_dedup_hits_total", "signals suppressed by the dedup cache"),
            cleaner_rows_deleted: counter("hlm_cleaner_rows_deleted_total", "rows removed by the retention cleaner"),
        };

        for c in [
            &m.ws_reconnects,
            &m.connections_failed,
            &m.subscribe_capacity_exhausted,
            &m.queue_synchronous_fallbacks,
            &m.events_processed,
            &m.events_malformed,
            &m.signals_emitted,
            &m.flush_retry_exhausted,
            &m.batch_flushes,
            &m.batch_flush_errors,
            &m.dedup_hits,
            &m.cleaner_rows_deleted,
        ] {
            m.registry
                .register(Box::new(c.clone()))
                .expect("metric registration");
        }
        for g in [
            &m.connections_active,
            &m.subscriptions_active,
            &m.queue_depth,
            &m.aggregations_open,
        ] {
            m.registry
                .register(Box::new(g.clone()))
                .expect("metric registration");
        }

        m
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .expect("prometheus encoding never fails for well-formed metrics");
        String::from_utf8(buf).expect("prometheus text output is valid utf8")
    }
}

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);
