//! Bi-directional asset-name ↔ tradable-symbol map (spec.md §3: "Symbol
//! map"), refreshed periodically from an external source.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Capability the symbol map needs to refresh itself. Implemented by a
/// collaborator outside this crate's core (spec.md §1: "symbol metadata
/// fetcher" is an external collaborator).
#[async_trait]
pub trait SymbolSource: Send + Sync {
    /// Returns `(asset_name, tradable_symbol)` pairs, e.g.
    /// `("@123", "ETHUSDC")`, `("BTC", "BTC")`.
    async fn load_symbols(&self) -> Result<Vec<(String, String)>>;
}

#[derive(Default)]
pub struct SymbolMap {
    asset_to_symbol: DashMap<String, String>,
    symbol_to_asset: DashMap<String, String>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol_for_asset(&self, asset_name: &str) -> Option<String> {
        self.asset_to_symbol.get(asset_name).map(|v| v.clone())
    }

    pub fn asset_for_symbol(&self, symbol: &str) -> Option<String> {
        self.symbol_to_asset.get(symbol).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.asset_to_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.asset_to_symbol.is_empty()
    }

    fn replace_all(&self, pairs: Vec<(String, String)>) {
        self.asset_to_symbol.clear();
        self.symbol_to_asset.clear();
        for (asset, symbol) in pairs {
            self.asset_to_symbol.insert(asset.clone(), symbol.clone());
            self.symbol_to_asset.insert(symbol, asset);
        }
    }

    pub async fn refresh(&self, source: &dyn SymbolSource) -> Result<()> {
        let pairs = source.load_symbols().await?;
        self.replace_all(pairs);
        Ok(())
    }
}

/// Periodic reload loop, mirroring the address loader's cadence model.
pub async fn run_refresh_loop(
    map: std::sync::Arc<SymbolMap>,
    source: std::sync::Arc<dyn SymbolSource>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    loop {
        if let Err(e) = map.refresh(source.as_ref()).await {
            tracing::warn!(error = %e, "symbol map refresh failed, keeping previous map");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource;
    #[async_trait]
    impl SymbolSource for FakeSource {
        async fn load_symbols(&self) -> Result<Vec<(String, String)>> {
            Ok(vec![
                ("@123".to_string(), "ETHUSDC".to_string()),
                ("BTC".to_string(), "BTC".to_string()),
            ])
        }
    }

    #[tokio::test]
    async fn refresh_populates_both_directions() {
        let map = SymbolMap::new();
        map.refresh(&FakeSource).await.unwrap();
        assert_eq!(map.symbol_for_asset("@123").as_deref(), Some("ETHUSDC"));
        assert_eq!(map.asset_for_symbol("ETHUSDC").as_deref(), Some("@123"));
        assert_eq!(map.symbol_for_asset("BTC").as_deref(), Some("BTC"));
    }
}
