//! Per-order pending state: the `PendingOrder{key, agg, seenTids,
//! createdAt, statusObserved}` record from spec.md §4.3.

use crate::schema::{Address, Direction, OrderAggregation, TidKey};
use dashmap::DashSet;
use rust_decimal::Decimal;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub address: Address,
    pub oid: i64,
    pub direction: Direction,
}

impl std::fmt::Display for PendingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{:?}", self.address, self.oid, self.direction)
    }
}

/// One order's accumulating state. `pre_position` is the absolute size
/// of the opposing position captured the moment this aggregation was
/// created, used as the close-rate denominator so a later, unrelated
/// position-cache refresh can't retroactively change an in-flight
/// order's close rate.
pub struct PendingOrder {
    pub key: PendingKey,
    pub agg: Mutex<OrderAggregation>,
    pub seen_tids: DashSet<TidKey>,
    pub created_at: i64,
    pub pre_position: Decimal,
    pub flushed: AtomicBool,
}

impl PendingOrder {
    pub fn new(key: PendingKey, symbol: String, side: crate::schema::Side, pre_position: Decimal) -> Self {
        let now = crate::util::now_ms();
        PendingOrder {
            agg: Mutex::new(OrderAggregation {
                address: key.address.clone(),
                oid: key.oid,
                direction: key.direction,
                symbol,
                side,
                fills: Vec::new(),
                total_size: Decimal::ZERO,
                weighted_avg_px: Decimal::ZERO,
                last_fill_time: 0,
                order_status: crate::schema::OrderStatus::Pending,
                signal_sent: false,
                updated_at: now,
            }),
            key,
            seen_tids: DashSet::new(),
            created_at: now,
            pre_position,
            flushed: AtomicBool::new(false),
        }
    }
}
