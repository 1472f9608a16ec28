//! Scan adjacency: for every spot listing, which exchanges carry the same
//! symbol as a future. Built once at startup; the scanner walks it every
//! cycle.

use std::collections::BTreeMap;

use crate::catalog::MarketCatalog;
use crate::exchanges::Exchange;

/// One spot symbol and every exchange (the listing exchange included) that
/// trades its future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotPairing {
    pub symbol: String,
    pub future_exchanges: Vec<Exchange>,
}

#[derive(Debug, Clone, Default)]
pub struct AdjacencyMap {
    entries: BTreeMap<Exchange, Vec<SpotPairing>>,
}

impl AdjacencyMap {
    /// Index future listings by symbol, then bucket each exchange's spot
    /// symbols against that index. Spot symbols with no future listing
    /// anywhere are dropped.
    pub fn build(catalog: &MarketCatalog) -> Self {
        let mut futures_by_symbol: BTreeMap<&str, Vec<Exchange>> = BTreeMap::new();
        for (exchange, markets) in &catalog.exchanges {
            for symbol in &markets.future {
                futures_by_symbol
                    .entry(symbol.as_str())
                    .or_default()
                    .push(*exchange);
            }
        }

        let mut entries: BTreeMap<Exchange, Vec<SpotPairing>> = BTreeMap::new();
        for (exchange, markets) in &catalog.exchanges {
            let pairings: Vec<SpotPairing> = markets
                .spot
                .iter()
                .filter_map(|symbol| {
                    futures_by_symbol.get(symbol.as_str()).map(|fut| SpotPairing {
                        symbol: symbol.clone(),
                        future_exchanges: fut.clone(),
                    })
                })
                .collect();
            if !pairings.is_empty() {
                entries.insert(*exchange, pairings);
            }
        }

        Self { entries }
    }

    /// Flat walk over every (spot exchange, pairing).
    pub fn iter(&self) -> impl Iterator<Item = (Exchange, &SpotPairing)> {
        self.entries
            .iter()
            .flat_map(|(exchange, pairings)| pairings.iter().map(move |p| (*exchange, p)))
    }

    /// Number of scannable (spot leg, future leg) pairs.
    pub fn pair_count(&self) -> usize {
        self.iter().map(|(_, p)| p.future_exchanges.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(json: &str) -> MarketCatalog {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_spot_pairs_with_other_exchange_future() {
        let map = AdjacencyMap::build(&catalog(
            r#"{"binance": {"spot": ["BTC"]}, "gate": {"future": ["BTC"]}}"#,
        ));

        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, Exchange::Binance);
        assert_eq!(pairs[0].1.symbol, "BTC");
        assert_eq!(pairs[0].1.future_exchanges, [Exchange::Gate]);
    }

    #[test]
    fn test_same_exchange_basis_pair_is_included() {
        let map = AdjacencyMap::build(&catalog(
            r#"{"binance": {"spot": ["ETH"], "future": ["ETH"]}}"#,
        ));

        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1.future_exchanges, [Exchange::Binance]);
    }

    #[test]
    fn test_unlisted_futures_drop_the_symbol() {
        let map = AdjacencyMap::build(&catalog(
            r#"{"binance": {"spot": ["BTC", "XRP"], "future": ["BTC"]}, "gate": {"spot": ["XRP"]}}"#,
        ));

        assert!(map.iter().all(|(_, p)| p.symbol != "XRP"));
        assert_eq!(map.pair_count(), 1);
    }

    #[test]
    fn test_pair_count_spans_multiple_future_venues() {
        let map = AdjacencyMap::build(&catalog(
            r#"{
                "binance": {"spot": ["BTC"], "future": ["BTC"]},
                "gate": {"spot": ["BTC"], "future": ["BTC"]}
            }"#,
        ));

        // Each of the two spot legs pairs with both future venues
        assert_eq!(map.pair_count(), 4);
        assert!(!map.is_empty());
    }

    #[test]
    fn test_empty_catalog_builds_empty_map() {
        let map = AdjacencyMap::build(&MarketCatalog::default());
        assert!(map.is_empty());
        assert_eq!(map.pair_count(), 0);
    }
}
