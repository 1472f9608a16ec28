//! Market catalog: which symbols we watch on which exchange and market.
//!
//! Loaded from a JSON file shaped as
//! `{"binance": {"spot": [...], "future": [...]}, "gate": {...}}` where the
//! lists hold base symbols ("BTC", not venue pairs).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exchanges::{Exchange, MarketKind};

/// Symbols never scanned (venue test tokens).
const EXCLUDED_SYMBOLS: &[&str] = &["TST"];

/// Symbol lists for one exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeMarkets {
    #[serde(default)]
    pub spot: Vec<String>,
    #[serde(default)]
    pub future: Vec<String>,
}

impl ExchangeMarkets {
    pub fn symbols(&self, market: MarketKind) -> &[String] {
        match market {
            MarketKind::Spot => &self.spot,
            MarketKind::Future => &self.future,
        }
    }
}

/// The full catalog, keyed by exchange. An unknown exchange name in the
/// file is a load error, not a silent skip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketCatalog {
    pub exchanges: BTreeMap<Exchange, ExchangeMarkets>,
}

impl MarketCatalog {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read market catalog {}", path.display()))?;
        let catalog: Self = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse market catalog {}", path.display()))?;
        Ok(catalog)
    }

    /// Keep only symbols listed as spot on at least one exchange AND as a
    /// future on at least one exchange. Everything else can never form an
    /// arbitrage pair, so streaming it would be waste.
    pub fn retain_cross_listed(&mut self) {
        let mut spot_anywhere: BTreeSet<&str> = BTreeSet::new();
        let mut future_anywhere: BTreeSet<&str> = BTreeSet::new();
        for markets in self.exchanges.values() {
            spot_anywhere.extend(markets.spot.iter().map(String::as_str));
            future_anywhere.extend(markets.future.iter().map(String::as_str));
        }

        let keep: BTreeSet<String> = spot_anywhere
            .intersection(&future_anywhere)
            .filter(|s| !EXCLUDED_SYMBOLS.contains(s))
            .map(|s| s.to_string())
            .collect();

        for (exchange, markets) in &mut self.exchanges {
            markets.spot.retain(|s| keep.contains(s));
            markets.future.retain(|s| keep.contains(s));
            info!(
                "📊 {}: {} spot / {} future symbols cross-listed",
                exchange,
                markets.spot.len(),
                markets.future.len()
            );
        }
    }

    pub fn symbols(&self, exchange: Exchange, market: MarketKind) -> &[String] {
        self.exchanges
            .get(&exchange)
            .map(|m| m.symbols(market))
            .unwrap_or(&[])
    }

    /// All (exchange, market) feeds with at least one symbol.
    pub fn feeds(&self) -> impl Iterator<Item = (Exchange, MarketKind, &[String])> {
        self.exchanges.iter().flat_map(|(exchange, markets)| {
            [MarketKind::Spot, MarketKind::Future]
                .into_iter()
                .map(|market| (*exchange, market, markets.symbols(market)))
                .filter(|(_, _, symbols)| !symbols.is_empty())
        })
    }

    pub fn symbol_count(&self) -> usize {
        self.exchanges
            .values()
            .map(|m| m.spot.len() + m.future.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.symbol_count() == 0
    }
}
