//! Row shapes for the tables named in spec.md §6. Kept separate from
//! `schema.rs`'s domain types so a storage-format change (json column
//! layout, column renames) doesn't ripple into pipeline logic.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct WatchAddressRow {
    pub id: i64,
    pub player_id: Option<i64>,
    pub address: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct AddressSignalRow {
    pub id: i64,
    pub address: String,
    pub oid: i64,
    pub symbol: String,
    pub asset_type: String,
    pub direction: String,
    pub side: String,
    pub price: Decimal,
    pub size: Decimal,
    pub position_rate: Decimal,
    pub close_rate: Decimal,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}
