//! Central data model shared across the pipeline.
//!
//! This mirrors the role the teacher's `schema.rs` plays (the one
//! stable vocabulary every layer — connection pool, aggregator,
//! processor, persistence — agrees on), generalized from "exchange
//! trade/book/ticker" to "Hyperliquid fill/order/signal/position".

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A watched on-chain account, validated to be a 42-char `0x` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        crate::util::is_valid_address(&raw).then_some(Address(raw))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which side of the book a fill or position sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

/// Whether a fill opens or closes position on its side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Open,
    Close,
}

/// The order lifecycle status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// `filled`, `canceled`, `rejected` — a status that will never
    /// change again and is therefore safe to flush on.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Spot,
    Perp,
}

/// Disambiguated fill identifier. A reversal fill is split into a
/// `close` half and an `open` half that share a `tid`; each half gets
/// a suffixed key so the two can coexist as distinct entries in a
/// `seenTids` set without colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TidKey {
    Raw(i64),
    ClosePart(i64),
    OpenPart(i64),
}

impl std::fmt::Display for TidKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TidKey::Raw(t) => write!(f, "{t}"),
            TidKey::ClosePart(t) => write!(f, "{t}:c"),
            TidKey::OpenPart(t) => write!(f, "{t}:o"),
        }
    }
}

/// A single matched trade record, part of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub address: Address,
    pub oid: i64,
    pub tid: i64,
    pub coin: String,
    pub side: Side,
    pub px: Decimal,
    pub sz: Decimal,
    /// Unix ms.
    pub time: i64,
    pub crossed: bool,
}

/// A status transition for an order, delivered on the `orderUpdates`
/// channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusEvent {
    pub address: Address,
    pub oid: i64,
    pub status: OrderStatus,
    pub time: i64,
}

/// The running summary of one order's fills, keyed by
/// `(address, oid, direction)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAggregation {
    pub address: Address,
    pub oid: i64,
    pub direction: Direction,
    pub symbol: String,
    pub side: Side,
    /// Kept for dedup/audit; the commutative fields below are what
    /// downstream logic actually reads.
    pub fills: Vec<Fill>,
    pub total_size: Decimal,
    pub weighted_avg_px: Decimal,
    pub last_fill_time: i64,
    pub order_status: OrderStatus,
    pub signal_sent: bool,
    pub updated_at: i64,
}

impl OrderAggregation {
    /// Absorbs one fill's contribution into the running sum/weighted
    /// average. Caller is responsible for dedup on `tid` before calling.
    pub fn absorb(&mut self, fill: &Fill) {
        let notional = self.weighted_avg_px * self.total_size + fill.px * fill.sz;
        self.total_size += fill.sz;
        self.weighted_avg_px = if self.total_size.is_zero() {
            Decimal::ZERO
        } else {
            notional / self.total_size
        };
        self.last_fill_time = self.last_fill_time.max(fill.time);
        self.updated_at = crate::util::now_ms();
    }
}

/// The downstream event derived from a completed aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub address: Address,
    pub oid: i64,
    pub symbol: String,
    pub asset_type: AssetType,
    pub direction: Direction,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub position_rate: Decimal,
    pub close_rate: Decimal,
    pub expired_at: i64,
}

/// A single spot or futures holding inside a `PositionSnapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotBalance {
    pub asset: String,
    pub total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesPosition {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_px: Decimal,
}

/// Per-address snapshot of holdings, updated from a separate
/// subscription and read by signal construction for `close_rate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub address: Address,
    pub spot_total_usd: Decimal,
    pub account_value: Decimal,
    pub spot_balances: Vec<SpotBalance>,
    pub futures_positions: Vec<FuturesPosition>,
    pub total_margin_used: Decimal,
    pub total_ntl_pos: Decimal,
    pub withdrawable: Decimal,
    pub updated_at: i64,
}

impl PositionSnapshot {
    /// Signed size of the existing position on `symbol` (positive for
    /// long, negative for short), used as the reversal pivot.
    pub fn signed_size(&self, symbol: &str) -> Decimal {
        self.futures_positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| match p.side {
                Side::Long => p.size,
                Side::Short => -p.size,
            })
            .unwrap_or(Decimal::ZERO)
    }
}

/// A row from the `watch_addresses` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedAddress {
    pub id: i64,
    pub player_id: Option<i64>,
    pub address: Address,
}

/// Inbound WebSocket envelope kinds this system consumes (spec.md §6):
/// `orderUpdates` (status transitions) and `userFills` (per-fill rows).
/// Anything else (pong, subscription ack, unrecognized) is `Control`.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Fills(Vec<Fill>),
    OrderStatuses(Vec<OrderStatusEvent>),
    Position(PositionSnapshot),
    Control,
}

impl crate::batch_writer::DedupKey for OrderAggregation {
    type Key = (i64, Address, Direction);
    fn dedup_key(&self) -> Self::Key {
        (self.oid, self.address.clone(), self.direction)
    }
}

impl crate::batch_writer::DedupKey for PositionSnapshot {
    type Key = Address;
    fn dedup_key(&self) -> Self::Key {
        self.address.clone()
    }
}

impl crate::batch_writer::DedupKey for Signal {
    type Key = (Address, i64, Direction);
    fn dedup_key(&self) -> Self::Key {
        (self.address.clone(), self.oid, self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_rejects_bad_shape() {
        assert!(Address::new("not-an-address").is_none());
        assert!(Address::new("0x1234567890123456789012345678901234567890").is_some());
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
    }

    #[test]
    fn tid_key_display() {
        assert_eq!(TidKey::Raw(7).to_string(), "7");
        assert_eq!(TidKey::ClosePart(7).to_string(), "7:c");
        assert_eq!(TidKey::OpenPart(7).to_string(), "7:o");
    }
}
