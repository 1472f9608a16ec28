//! Last-trade price store.
//!
//! One lock-free slot per (exchange, market, symbol), written by the tick
//! feeds and read by the scanner every cycle. The slot set is frozen at
//! startup from the catalog so readers and writers never touch a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::catalog::MarketCatalog;
use crate::exchanges::{Exchange, MarketKind};

/// A single last-price cell. Stored as raw f64 bits; zero bits mean no
/// trade seen yet.
#[derive(Debug, Default)]
pub struct TickSlot(AtomicU64);

impl TickSlot {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Record a trade price. Non-finite and non-positive values are dropped
    /// at the door so readers never have to re-validate.
    #[inline]
    pub fn store(&self, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.0.store(price.to_bits(), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn load(&self) -> Option<f64> {
        let price = f64::from_bits(self.0.load(Ordering::Relaxed));
        if price > 0.0 && price.is_finite() {
            Some(price)
        } else {
            None
        }
    }
}

/// All tick slots, keyed by feed then base symbol.
pub struct TickStore {
    slots: HashMap<(Exchange, MarketKind), HashMap<String, Arc<TickSlot>>>,
}

impl TickStore {
    /// Allocate one slot per catalog symbol.
    pub fn new(catalog: &MarketCatalog) -> Self {
        let mut slots: HashMap<(Exchange, MarketKind), HashMap<String, Arc<TickSlot>>> =
            HashMap::new();
        for (exchange, market, symbols) in catalog.feeds() {
            let entry = slots.entry((exchange, market)).or_default();
            for symbol in symbols {
                entry.insert(symbol.clone(), Arc::new(TickSlot::new()));
            }
        }
        Self { slots }
    }

    /// Latest trade price, `None` until the first trade arrives (or for
    /// symbols outside the catalog).
    #[inline]
    pub fn price(&self, exchange: Exchange, market: MarketKind, symbol: &str) -> Option<f64> {
        self.slots
            .get(&(exchange, market))?
            .get(symbol)?
            .load()
    }

    /// Writer handle for one symbol's slot.
    pub fn slot(&self, exchange: Exchange, market: MarketKind, symbol: &str) -> Option<Arc<TickSlot>> {
        self.slots.get(&(exchange, market))?.get(symbol).cloned()
    }

    /// All (base symbol, slot) pairs for one feed. Used by the feed task to
    /// build its venue-symbol dispatch table.
    pub fn slots_for(
        &self,
        exchange: Exchange,
        market: MarketKind,
    ) -> impl Iterator<Item = (&str, Arc<TickSlot>)> + '_ {
        self.slots
            .get(&(exchange, market))
            .into_iter()
            .flat_map(|m| m.iter().map(|(s, slot)| (s.as_str(), slot.clone())))
    }

    pub fn slot_count(&self) -> usize {
        self.slots.values().map(|m| m.len()).sum()
    }
}
