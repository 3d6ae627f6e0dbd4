//! Order aggregator: direction derivation, reversal splitting, and
//! dual-trigger emission (spec.md §4.3).

use super::status_tracker::StatusTracker;
use super::types::{PendingKey, PendingOrder};
use crate::caches::dedup::{dedup_key, DedupCache};
use crate::caches::position::PositionCache;
use crate::caches::price::PriceCache;
use crate::caches::symbol_map::SymbolMap;
use crate::concurrent::ConcurrentMap;
use crate::config::{OrderAggregationConfig, SharedOrderAggregationConfig};
use crate::error::Result;
use crate::metrics::METRICS;
use crate::schema::{
    AssetType, Direction, Fill, OrderAggregation, OrderStatus, OrderStatusEvent, Side, Signal, TidKey,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 8); // 0.00000001

/// How long a symbol's last observed trade price stays usable as a
/// fallback when an order carries no parseable price of its own.
const LAST_TRADE_PRICE_TTL_MS: i64 = 60_000;

/// Composition boundary for "publish + persist one completed signal".
/// The aggregator retries this as a unit per spec.md §4.3; what happens
/// inside (bus publish, DB upsert, or both) is the caller's concern.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn emit(&self, signal: &Signal) -> Result<()>;
}

pub struct OrderAggregator {
    pending: ConcurrentMap<PendingKey, Arc<PendingOrder>>,
    status_tracker: Arc<StatusTracker>,
    position_cache: Arc<PositionCache>,
    symbol_map: Arc<SymbolMap>,
    price_cache: Arc<PriceCache>,
    dedup: Arc<DedupCache>,
    sink: Arc<dyn SignalSink>,
    config: SharedOrderAggregationConfig,
}

fn asset_type_of(asset_name: &str) -> AssetType {
    if asset_name.starts_with('@') {
        AssetType::Spot
    } else {
        AssetType::Perp
    }
}

fn split_fill(fill: &Fill, size: Decimal) -> Fill {
    let mut f = fill.clone();
    f.sz = size;
    f
}

impl OrderAggregator {
    pub fn new(
        status_tracker: Arc<StatusTracker>,
        position_cache: Arc<PositionCache>,
        symbol_map: Arc<SymbolMap>,
        price_cache: Arc<PriceCache>,
        dedup: Arc<DedupCache>,
        sink: Arc<dyn SignalSink>,
        config: SharedOrderAggregationConfig,
    ) -> Self {
        Self {
            pending: ConcurrentMap::new(),
            status_tracker,
            position_cache,
            symbol_map,
            price_cache,
            dedup,
            sink,
            config,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Entry point for every inbound fill. Derives direction, splits
    /// reversal fills in two, and routes each half to its own
    /// aggregation.
    pub async fn handle_fill(&self, fill: Fill) {
        let symbol = self
            .symbol_map
            .symbol_for_asset(&fill.coin)
            .unwrap_or_else(|| fill.coin.clone());
        let asset_type = asset_type_of(&fill.coin);

        let position = self.position_cache.get(&fill.address);
        let pre_signed = position.as_ref().map(|p| p.signed_size(&symbol)).unwrap_or(Decimal::ZERO);

        let existing_side = if pre_signed.is_sign_positive() && !pre_signed.is_zero() {
            Some(Side::Long)
        } else if pre_signed.is_sign_negative() {
            Some(Side::Short)
        } else {
            None
        };

        let opens = existing_side.is_none() || existing_side == Some(fill.side);

        if opens {
            self.route_fill(&fill, &symbol, asset_type, Direction::Open, fill.sz, TidKey::Raw(fill.tid), Decimal::ZERO)
                .await;
            return;
        }

        let abs_pre = pre_signed.abs();
        if fill.sz <= abs_pre {
            self.route_fill(&fill, &symbol, asset_type, Direction::Close, fill.sz, TidKey::Raw(fill.tid), abs_pre)
                .await;
        } else {
            let close_part = abs_pre;
            let open_part = fill.sz - abs_pre;
            self.route_fill(&fill, &symbol, asset_type, Direction::Close, close_part, TidKey::ClosePart(fill.tid), abs_pre)
                .await;
            self.route_fill(&fill, &symbol, asset_type, Direction::Open, open_part, TidKey::OpenPart(fill.tid), Decimal::ZERO)
                .await;
        }
    }

    async fn route_fill(
        &self,
        fill: &Fill,
        symbol: &str,
        asset_type: AssetType,
        direction: Direction,
        size: Decimal,
        tid_key: TidKey,
        pre_position: Decimal,
    ) {
        if size.is_zero() {
            return;
        }

        let key = PendingKey {
            address: fill.address.clone(),
            oid: fill.oid,
            direction,
        };

        let entry = self.pending.load_or_store(key.clone(), || {
            Arc::new(PendingOrder::new(key.clone(), symbol.to_string(), fill.side, pre_position))
        });
        let order = entry.clone();
        drop(entry);
        METRICS.aggregations_open.set(self.pending.len() as i64);

        if !order.seen_tids.insert(tid_key) {
            return; // duplicate delivery of a fill we've already absorbed
        }

        let part = split_fill(fill, size);
        if !part.px.is_zero() {
            self.price_cache.update(symbol, part.px);
        }
        {
            let mut agg = order.agg.lock().expect("lock not poisoned");
            agg.fills.push(part.clone());
            agg.absorb(&part);
        }

        self.evaluate_triggers(&order, asset_type).await;
    }

    /// Called when an `orderUpdates` status event arrives. Feeds the
    /// status tracker (for late-fill rescue) and, if an aggregation for
    /// this `(address, oid)` already exists in either direction,
    /// updates its status and re-checks triggers.
    pub async fn handle_status(&self, event: OrderStatusEvent) {
        self.status_tracker.observe(&event.address, event.oid, event.status);

        for direction in [Direction::Open, Direction::Close] {
            let key = PendingKey {
                address: event.address.clone(),
                oid: event.oid,
                direction,
            };
            if let Some(order) = self.pending.get(&key).map(|r| r.clone()) {
                let asset_type = {
                    let mut agg = order.agg.lock().expect("lock not poisoned");
                    agg.order_status = event.status;
                    asset_type_of(&agg.symbol)
                };
                self.evaluate_triggers(&order, asset_type).await;
            }
        }
    }

    async fn evaluate_triggers(&self, order: &Arc<PendingOrder>, asset_type: AssetType) {
        let terminal = {
            let agg = order.agg.lock().expect("lock not poisoned");
            agg.order_status.is_terminal()
        } || self
            .status_tracker
            .terminal_for(&order.key.address, order.key.oid)
            .is_some();

        if terminal {
            self.try_flush(order, asset_type).await;
        }
    }

    /// Invoked by the background timeout scanner for every pending
    /// order older than `config.timeout()`.
    pub async fn scan_timeouts(&self) {
        let timeout_ms = self.config.read().await.timeout().as_millis() as i64;
        let now = crate::util::now_ms();
        let expired: Vec<Arc<PendingOrder>> = self
            .pending
            .iter()
            .filter(|e| !e.value().flushed.load(Ordering::SeqCst) && now - e.value().created_at > timeout_ms)
            .map(|e| e.value().clone())
            .collect();

        for order in expired {
            let asset_type = {
                let agg = order.agg.lock().expect("lock not poisoned");
                asset_type_of(&agg.symbol)
            };
            self.try_flush(&order, asset_type).await;
        }
    }

    pub async fn run_timeout_scanner(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = self.config.read().await.scan_interval();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    self.scan_timeouts().await;
                }
            }
        }
    }

    /// CAS-guarded flush: only the first caller (status trigger or
    /// timeout scanner) to win the `flushed` swap actually emits.
    async fn try_flush(&self, order: &Arc<PendingOrder>, asset_type: AssetType) {
        if order.flushed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }

        let key = dedup_key(&order.key.address, order.key.oid, order.key.direction);
        if self.dedup.is_seen(&key) {
            METRICS.dedup_hits.inc();
            return;
        }

        let signal = {
            let mut agg = order.agg.lock().expect("lock not poisoned");
            let signal = self.build_signal(&agg, asset_type, order.pre_position);
            agg.signal_sent = true;
            signal
        };

        let (max_retry, retry_delay) = {
            let cfg = self.config.read().await;
            (cfg.max_retry, cfg.retry_delay())
        };

        for attempt in 0..=max_retry {
            match self.sink.emit(&signal).await {
                Ok(()) => {
                    self.dedup.mark(&key);
                    METRICS.signals_emitted.inc();
                    return;
                }
                Err(e) => {
                    tracing::warn!(key = %order.key, attempt, error = %e, "signal emit failed");
                    if attempt < max_retry {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }

        METRICS.flush_retry_exhausted.inc();
        tracing::error!(key = %order.key, "signal emit exhausted retries, order retained for reaping");
    }

    fn build_signal(&self, agg: &OrderAggregation, asset_type: AssetType, pre_position: Decimal) -> Signal {
        // weighted_avg_px is derived from this order's own fills and is
        // the right price in the normal case; the cache only covers the
        // degenerate case where that average is zero (e.g. a reopened
        // aggregation whose fills somehow carried no price).
        let price = if agg.weighted_avg_px.is_zero() {
            self.price_cache
                .get_fresh(&agg.symbol, LAST_TRADE_PRICE_TTL_MS)
                .unwrap_or(agg.weighted_avg_px)
        } else {
            agg.weighted_avg_px
        };
        let notional = price * agg.total_size;
        let account_value = self
            .position_cache
            .get(&agg.address)
            .map(|p| p.account_value)
            .filter(|v| !v.is_zero())
            .unwrap_or(Decimal::ONE);

        // `pre_position` was captured when this aggregation was created,
        // i.e. the opposing position's size before any of this order's
        // own fills touched it — so no further adjustment for
        // already-flushed fills of this same order is needed here.
        let close_rate = match agg.direction {
            Direction::Close => {
                let pre = pre_position.max(EPSILON);
                crate::util::clamp_decimal(agg.total_size / pre, Decimal::ZERO, Decimal::ONE)
            }
            Direction::Open => Decimal::ZERO,
        };

        Signal {
            address: agg.address.clone(),
            oid: agg.oid,
            symbol: agg.symbol.clone(),
            asset_type,
            direction: agg.direction,
            side: agg.side,
            price,
            size: agg.total_size,
            position_rate: notional / account_value.max(EPSILON),
            close_rate,
            expired_at: crate::util::now_ms() + super::status_tracker::DEFAULT_TTL.as_millis() as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Address, FuturesPosition, OrderStatus, PositionSnapshot};
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingSink(StdMutex<Vec<Signal>>);
    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Vec::new())))
        }
        fn signals(&self) -> Vec<Signal> {
            self.0.lock().unwrap().clone()
        }
    }
    #[async_trait]
    impl SignalSink for RecordingSink {
        async fn emit(&self, signal: &Signal) -> Result<()> {
            self.0.lock().unwrap().push(signal.clone());
            Ok(())
        }
    }

    fn addr() -> Address {
        Address::new("0x1234567890123456789012345678901234567890").unwrap()
    }

    fn aggregator(sink: Arc<RecordingSink>) -> OrderAggregator {
        OrderAggregator::new(
            Arc::new(StatusTracker::new(Duration::from_secs(600))),
            Arc::new(PositionCache::new()),
            Arc::new(SymbolMap::new()),
            Arc::new(PriceCache::new()),
            Arc::new(DedupCache::new(Duration::from_secs(1800))),
            sink,
            Arc::new(tokio::sync::RwLock::new(OrderAggregationConfig {
                timeout_secs: 300,
                scan_interval_secs: 30,
                max_retry: 3,
                retry_delay_ms: 1,
            })),
        )
    }

    fn fill(oid: i64, tid: i64, side: Side, px: Decimal, sz: Decimal) -> Fill {
        Fill {
            address: addr(),
            oid,
            tid,
            coin: "BTC".to_string(),
            side,
            px,
            sz,
            time: crate::util::now_ms(),
            crossed: true,
        }
    }

    #[tokio::test]
    async fn scenario_1_single_fill_terminal() {
        let sink = RecordingSink::new();
        let agg = aggregator(sink.clone());
        agg.handle_fill(fill(1, 10, Side::Long, dec!(100), dec!(2))).await;
        agg.handle_status(OrderStatusEvent { address: addr(), oid: 1, status: OrderStatus::Filled, time: 0 }).await;

        let signals = sink.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Open);
        assert_eq!(signals[0].side, Side::Long);
        assert_eq!(signals[0].price, dec!(100));
        assert_eq!(signals[0].size, dec!(2));
        assert_eq!(signals[0].close_rate, Decimal::ZERO);
    }

    #[tokio::test]
    async fn scenario_2_multi_fill_weighted_average() {
        let sink = RecordingSink::new();
        let agg = aggregator(sink.clone());
        agg.handle_fill(fill(2, 1, Side::Long, dec!(100), dec!(1))).await;
        agg.handle_fill(fill(2, 2, Side::Long, dec!(110), dec!(3))).await;
        agg.handle_status(OrderStatusEvent { address: addr(), oid: 2, status: OrderStatus::Filled, time: 0 }).await;

        let signals = sink.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].price, dec!(107.5));
        assert_eq!(signals[0].size, dec!(4));
    }

    #[tokio::test]
    async fn scenario_3_duplicate_tid_absorbed_once() {
        let sink = RecordingSink::new();
        let agg = aggregator(sink.clone());
        agg.handle_fill(fill(3, 10, Side::Long, dec!(100), dec!(2))).await;
        agg.handle_fill(fill(3, 10, Side::Long, dec!(100), dec!(2))).await; // duplicate
        agg.handle_status(OrderStatusEvent { address: addr(), oid: 3, status: OrderStatus::Filled, time: 0 }).await;

        let signals = sink.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].size, dec!(2));
    }

    #[tokio::test]
    async fn scenario_4_timeout_trigger() {
        let sink = RecordingSink::new();
        // zero timeout so the scan fires without a real 5-minute sleep
        let agg = OrderAggregator::new(
            Arc::new(StatusTracker::new(Duration::from_secs(600))),
            Arc::new(PositionCache::new()),
            Arc::new(SymbolMap::new()),
            Arc::new(PriceCache::new()),
            Arc::new(DedupCache::new(Duration::from_secs(1800))),
            sink.clone(),
            Arc::new(tokio::sync::RwLock::new(OrderAggregationConfig {
                timeout_secs: 0,
                scan_interval_secs: 30,
                max_retry: 1,
                retry_delay_ms: 1,
            })),
        );
        agg.handle_fill(fill(4, 1, Side::Long, dec!(100), dec!(1))).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        agg.scan_timeouts().await;

        let signals = sink.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Open);
    }

    #[tokio::test]
    async fn scenario_5_reversal_splits_into_close_and_open() {
        let sink = RecordingSink::new();
        let agg = aggregator(sink.clone());
        agg.position_cache.update(PositionSnapshot {
            address: addr(),
            spot_total_usd: Decimal::ZERO,
            account_value: dec!(1000),
            spot_balances: vec![],
            futures_positions: vec![FuturesPosition {
                symbol: "BTC".to_string(),
                side: Side::Long,
                size: dec!(1.0),
                entry_px: dec!(90),
            }],
            total_margin_used: Decimal::ZERO,
            total_ntl_pos: Decimal::ZERO,
            withdrawable: Decimal::ZERO,
            updated_at: 0,
        });

        agg.handle_fill(fill(5, 1, Side::Short, dec!(100), dec!(3.0))).await;
        agg.handle_status(OrderStatusEvent { address: addr(), oid: 5, status: OrderStatus::Filled, time: 0 }).await;

        let mut signals = sink.signals();
        signals.sort_by_key(|s| s.direction == Direction::Open);
        assert_eq!(signals.len(), 2);

        let close = signals.iter().find(|s| s.direction == Direction::Close).unwrap();
        assert_eq!(close.size, dec!(1.0));
        assert_eq!(close.close_rate, Decimal::ONE);

        let open = signals.iter().find(|s| s.direction == Direction::Open).unwrap();
        assert_eq!(open.size, dec!(2.0));
        assert_eq!(open.side, Side::Short);
        assert_eq!(open.close_rate, Decimal::ZERO);
    }

    #[tokio::test]
    async fn scenario_6_dedup_suppresses_replayed_signal() {
        let sink = RecordingSink::new();
        let agg = aggregator(sink.clone());
        agg.dedup.mark(&dedup_key(&addr(), 1, Direction::Open));

        agg.handle_fill(fill(1, 10, Side::Long, dec!(100), dec!(2))).await;
        agg.handle_status(OrderStatusEvent { address: addr(), oid: 1, status: OrderStatus::Filled, time: 0 }).await;

        assert!(sink.signals().is_empty());
    }
}
