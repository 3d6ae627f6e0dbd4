//! Latest mid/mark price per symbol, used where signal construction
//! needs a price outside the fill itself (e.g. valuing a non-quote
//! asset's contribution to `account_value`).

use dashmap::DashMap;
use rust_decimal::Decimal;

pub struct PriceCache {
    prices: DashMap<String, (Decimal, i64)>, // symbol -> (price, updated_at_ms)
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            prices: DashMap::new(),
        }
    }

    pub fn update(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_string(), (price, crate::util::now_ms()));
    }

    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).map(|v| v.0)
    }

    /// Returns the price only if it was updated within `max_age_ms`.
    pub fn get_fresh(&self, symbol: &str, max_age_ms: i64) -> Option<Decimal> {
        self.prices.get(symbol).and_then(|v| {
            let (price, updated_at) = *v;
            (crate::util::now_ms() - updated_at <= max_age_ms).then_some(price)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stores_and_reads_latest_price() {
        let cache = PriceCache::new();
        assert!(cache.get("BTC").is_none());
        cache.update("BTC", dec!(65000));
        assert_eq!(cache.get("BTC"), Some(dec!(65000)));
        cache.update("BTC", dec!(65500));
        assert_eq!(cache.get("BTC"), Some(dec!(65500)));
    }

    #[test]
    fn stale_price_excluded_from_fresh_lookup() {
        let cache = PriceCache::new();
        cache.update("BTC", dec!(1));
        assert!(cache.get_fresh("BTC", 10_000).is_some());
        assert!(cache.get_fresh("BTC", -1).is_none());
    }
}
