//! Per-address position snapshot, updated from a separate subscription
//! and read by signal construction for `close_rate`/`position_rate`.

use crate::schema::{Address, PositionSnapshot};
use dashmap::DashMap;

#[derive(Default)]
pub struct PositionCache {
    snapshots: DashMap<Address, PositionSnapshot>,
}

impl PositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, snapshot: PositionSnapshot) {
        self.snapshots.insert(snapshot.address.clone(), snapshot);
    }

    pub fn get(&self, address: &Address) -> Option<PositionSnapshot> {
        self.snapshots.get(address).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn addr() -> Address {
        Address::new("0x1234567890123456789012345678901234567890").unwrap()
    }

    #[test]
    fn updates_overwrite_by_address() {
        let cache = PositionCache::new();
        assert!(cache.get(&addr()).is_none());
        cache.update(PositionSnapshot {
            address: addr(),
            spot_total_usd: Decimal::ZERO,
            account_value: Decimal::ONE,
            spot_balances: vec![],
            futures_positions: vec![],
            total_margin_used: Decimal::ZERO,
            total_ntl_pos: Decimal::ZERO,
            withdrawable: Decimal::ZERO,
            updated_at: 0,
        });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&addr()).unwrap().account_value, Decimal::ONE);
    }
}
