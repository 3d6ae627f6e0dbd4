//! Repository traits + MySQL implementations for the four tables
//! spec.md §6 names. Each trait is the typed collaborator boundary the
//! source's empty-interface DAO injection becomes (spec.md §9).

use super::models::{AddressSignalRow, WatchAddressRow};
use super::pool::Database;
use crate::batch_writer::Upserter;
use crate::caches::dedup::SignalHistorySource;
use crate::caches::symbol_map::SymbolSource;
use crate::error::{MonitorError, Result};
use crate::schema::{
    Address, Direction, OrderAggregation, OrderStatus, PositionSnapshot, Side, Signal, WatchedAddress,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait AddressRepository: Send + Sync {
    async fn list_distinct_addresses(&self) -> Result<Vec<WatchedAddress>>;
}

fn direction_str(d: Direction) -> &'static str {
    match d {
        Direction::Open => "open",
        Direction::Close => "close",
    }
}
fn direction_from_str(s: &str) -> Direction {
    if s == "close" {
        Direction::Close
    } else {
        Direction::Open
    }
}
fn status_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::Pending => "pending",
        OrderStatus::Filled => "filled",
        OrderStatus::Canceled => "canceled",
        OrderStatus::Rejected => "rejected",
    }
}
fn side_str(s: Side) -> &'static str {
    match s {
        Side::Long => "long",
        Side::Short => "short",
    }
}
fn asset_type_str(a: crate::schema::AssetType) -> &'static str {
    match a {
        crate::schema::AssetType::Spot => "spot",
        crate::schema::AssetType::Perp => "perp",
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

pub struct MySqlStore {
    db: Database,
}

impl MySqlStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AddressRepository for MySqlStore {
    async fn list_distinct_addresses(&self) -> Result<Vec<WatchedAddress>> {
        let rows: Vec<WatchAddressRow> = sqlx::query_as("SELECT id, player_id, address FROM watch_addresses")
            .fetch_all(&self.db.pool)
            .await
            .map_err(|e| MonitorError::Transient(format!("list watch_addresses failed: {e}")))?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                Address::new(r.address).map(|address| WatchedAddress {
                    id: r.id,
                    player_id: r.player_id,
                    address,
                })
            })
            .collect())
    }
}

#[async_trait]
impl Upserter<OrderAggregation> for MySqlStore {
    async fn upsert_many(&self, rows: Vec<OrderAggregation>) -> Result<()> {
        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| MonitorError::Transient(format!("begin tx failed: {e}")))?;

        for agg in rows {
            let fills = serde_json::to_value(&agg.fills)
                .map_err(|e| MonitorError::Transient(format!("serialize fills failed: {e}")))?;

            sqlx::query(
                "INSERT INTO order_aggregation
                    (oid, address, direction, symbol, fills, total_size, weighted_avg_px, order_status, last_fill_time, updated_at, signal_sent)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    symbol = VALUES(symbol), fills = VALUES(fills), total_size = VALUES(total_size),
                    weighted_avg_px = VALUES(weighted_avg_px), order_status = VALUES(order_status),
                    last_fill_time = VALUES(last_fill_time), updated_at = VALUES(updated_at),
                    signal_sent = VALUES(signal_sent)",
            )
            .bind(agg.oid)
            .bind(agg.address.0.clone())
            .bind(direction_str(agg.direction))
            .bind(&agg.symbol)
            .bind(fills)
            .bind(agg.total_size)
            .bind(agg.weighted_avg_px)
            .bind(status_str(agg.order_status))
            .bind(agg.last_fill_time)
            .bind(millis_to_datetime(agg.updated_at))
            .bind(agg.signal_sent)
            .execute(&mut *tx)
            .await
            .map_err(|e| MonitorError::Transient(format!("upsert order_aggregation failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| MonitorError::Transient(format!("commit tx failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Upserter<Signal> for MySqlStore {
    async fn upsert_many(&self, rows: Vec<Signal>) -> Result<()> {
        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| MonitorError::Transient(format!("begin tx failed: {e}")))?;

        for sig in rows {
            sqlx::query(
                "INSERT INTO address_signal
                    (address, oid, symbol, asset_type, direction, side, price, size, position_rate, close_rate, created_at, expired_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    price = VALUES(price), size = VALUES(size), position_rate = VALUES(position_rate),
                    close_rate = VALUES(close_rate), expired_at = VALUES(expired_at)",
            )
            .bind(sig.address.0.clone())
            .bind(sig.oid)
            .bind(&sig.symbol)
            .bind(asset_type_str(sig.asset_type))
            .bind(direction_str(sig.direction))
            .bind(side_str(sig.side))
            .bind(sig.price)
            .bind(sig.size)
            .bind(sig.position_rate)
            .bind(sig.close_rate)
            .bind(Utc::now())
            .bind(millis_to_datetime(sig.expired_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| MonitorError::Transient(format!("upsert address_signal failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| MonitorError::Transient(format!("commit tx failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Upserter<PositionSnapshot> for MySqlStore {
    async fn upsert_many(&self, rows: Vec<PositionSnapshot>) -> Result<()> {
        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| MonitorError::Transient(format!("begin tx failed: {e}")))?;

        for snap in rows {
            let spot_balances = serde_json::to_value(&snap.spot_balances)
                .map_err(|e| MonitorError::Transient(format!("serialize spot_balances failed: {e}")))?;
            let futures_positions = serde_json::to_value(&snap.futures_positions)
                .map_err(|e| MonitorError::Transient(format!("serialize futures_positions failed: {e}")))?;

            sqlx::query(
                "INSERT INTO position_cache
                    (address, spot_balances, spot_total_usd, futures_positions, account_value, total_margin_used, total_ntl_pos, withdrawable, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    spot_balances = VALUES(spot_balances), spot_total_usd = VALUES(spot_total_usd),
                    futures_positions = VALUES(futures_positions), account_value = VALUES(account_value),
                    total_margin_used = VALUES(total_margin_used), total_ntl_pos = VALUES(total_ntl_pos),
                    withdrawable = VALUES(withdrawable), updated_at = VALUES(updated_at)",
            )
            .bind(snap.address.0.clone())
            .bind(spot_balances)
            .bind(snap.spot_total_usd)
            .bind(futures_positions)
            .bind(snap.account_value)
            .bind(snap.total_margin_used)
            .bind(snap.total_ntl_pos)
            .bind(snap.withdrawable)
            .bind(millis_to_datetime(snap.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| MonitorError::Transient(format!("upsert position_cache failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| MonitorError::Transient(format!("commit tx failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SignalHistorySource for MySqlStore {
    async fn get_sent_orders_since(&self, since_ms: i64) -> Result<Vec<(Address, i64, Direction, i64)>> {
        let rows: Vec<AddressSignalRow> = sqlx::query_as(
            "SELECT id, address, oid, symbol, asset_type, direction, side, price, size, position_rate, close_rate, created_at, expired_at
             FROM address_signal WHERE created_at >= ?",
        )
        .bind(millis_to_datetime(since_ms))
        .fetch_all(&self.db.pool)
        .await
        .map_err(|e| MonitorError::Transient(format!("query address_signal failed: {e}")))?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                Address::new(r.address).map(|address| {
                    (address, r.oid, direction_from_str(&r.direction), r.created_at.timestamp_millis())
                })
            })
            .collect())
    }
}

#[async_trait]
impl SymbolSource for MySqlStore {
    async fn load_symbols(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT asset_name, tradable_symbol FROM symbol_map")
            .fetch_all(&self.db.pool)
            .await
            .map_err(|e| MonitorError::Transient(format!("query symbol_map failed: {e}")))?;
        Ok(rows)
    }
}

