//! Order book data model and the process-wide book store
//!
//! Ownership rules:
//! - Each stream's [`LiveBook`] is private to the Book Synchronizer task that
//!   owns the stream; nothing else ever mutates it.
//! - After every applied message the synchronizer publishes an immutable
//!   [`BookView`] into the store entry via `ArcSwap`, so the scanner reads a
//!   consistent book without locks and never observes a half-applied diff.
//! - The store's outer map is only locked for entry insert/remove (stream
//!   creation and teardown).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::exchanges::StreamKey;

/// One price level. `size` is base-asset volume at `price`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }

    /// Cash depth of this level in quote currency.
    #[inline]
    pub fn cash(&self) -> f64 {
        self.price * self.size
    }
}

/// An incremental depth update: every level change between update-sequence
/// ids `first_id..=last_id`, as absolute (not delta) sizes. A size of
/// exactly zero removes the level.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthDiff {
    pub first_id: u64,
    pub last_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// A full REST depth snapshot. `last_id` is the venue's last applied
/// update-sequence id at snapshot time.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshot {
    pub last_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Upsert a level into a side kept sorted by price (bids descending, asks
/// ascending). Zero size deletes the level.
fn apply_level(levels: &mut Vec<PriceLevel>, price: f64, size: f64, is_bid: bool) {
    let pos = if is_bid {
        levels.iter().position(|l| l.price <= price)
    } else {
        levels.iter().position(|l| l.price >= price)
    };

    match pos {
        Some(i) if levels[i].price == price => {
            if size <= 0.0 {
                levels.remove(i);
            } else {
                levels[i].size = size;
            }
        }
        Some(i) if size > 0.0 => {
            levels.insert(i, PriceLevel { price, size });
        }
        None if size > 0.0 => {
            levels.push(PriceLevel { price, size });
        }
        _ => {}
    }
}

fn sort_side(levels: &mut [PriceLevel], is_bid: bool) {
    if is_bid {
        levels.sort_by(|a, b| b.price.total_cmp(&a.price));
    } else {
        levels.sort_by(|a, b| a.price.total_cmp(&b.price));
    }
}

/// The synchronizer-private working book for one stream.
#[derive(Debug, Default)]
pub struct LiveBook {
    /// Sorted descending (best bid first).
    pub bids: Vec<PriceLevel>,
    /// Sorted ascending (best ask first).
    pub asks: Vec<PriceLevel>,
    /// Last applied update-sequence id.
    pub sync_cursor: u64,
    /// True once the snapshot has been merged with any buffered diffs.
    pub ready: bool,
}

impl LiveBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear everything back to the pre-snapshot state.
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.sync_cursor = 0;
        self.ready = false;
    }

    /// Replace the book contents with a snapshot and position the cursor at
    /// its id. Does not flip `ready`; the synchronizer does that after the
    /// buffered replay succeeds.
    pub fn load_snapshot(&mut self, snapshot: &DepthSnapshot) {
        self.bids = snapshot.bids.clone();
        self.asks = snapshot.asks.clone();
        sort_side(&mut self.bids, true);
        sort_side(&mut self.asks, false);
        self.sync_cursor = snapshot.last_id;
    }

    /// Apply one diff's levels and advance the cursor. Sequence validation
    /// is the synchronizer's job; this only mutates.
    pub fn apply_diff(&mut self, diff: &DepthDiff) {
        for level in &diff.bids {
            apply_level(&mut self.bids, level.price, level.size, true);
        }
        for level in &diff.asks {
            apply_level(&mut self.asks, level.price, level.size, false);
        }
        self.sync_cursor = diff.last_id;
    }

    /// Immutable copy for publication to readers.
    pub fn view(&self) -> BookView {
        BookView {
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            sequence: self.sync_cursor,
        }
    }
}

/// Published read-side book: what the scanner sees.
#[derive(Debug, Clone, Default)]
pub struct BookView {
    /// Sorted descending (best bid first).
    pub bids: Vec<PriceLevel>,
    /// Sorted ascending (best ask first).
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
}

/// Per-stream store entry. Writers publish through it, readers load from it.
#[derive(Debug)]
pub struct BookHandle {
    view: ArcSwap<BookView>,
    ready: AtomicBool,
    updates: AtomicU64,
    resets: AtomicU64,
}

impl BookHandle {
    fn new() -> Self {
        Self {
            view: ArcSwap::new(Arc::new(BookView::default())),
            ready: AtomicBool::new(false),
            updates: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    /// Writer side: publish the current book state. `ready` must be stored
    /// after the view so readers that observe `ready` see the merged book.
    pub fn publish(&self, view: BookView, ready: bool) {
        self.view.store(Arc::new(view));
        self.ready.store(ready, Ordering::Release);
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Writer side: drop back to the unsynchronized state (reconnect/desync).
    pub fn mark_reset(&self) {
        self.ready.store(false, Ordering::Release);
        self.view.store(Arc::new(BookView::default()));
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Reader side: current published view (never blocks).
    #[inline]
    pub fn view(&self) -> Arc<BookView> {
        self.view.load_full()
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

/// Process-wide map of live book replicas, keyed by stream.
pub struct BookStore {
    books: RwLock<HashMap<StreamKey, Arc<BookHandle>>>,
}

impl Default for BookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BookStore {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::with_capacity(64)),
        }
    }

    /// Create (or replace) the entry for a stream and hand out the writer's
    /// handle. Called by the lifecycle manager when a stream starts.
    pub fn insert(&self, key: StreamKey) -> Arc<BookHandle> {
        let handle = Arc::new(BookHandle::new());
        self.books.write().insert(key, handle.clone());
        handle
    }

    /// Remove a stream's entry on teardown.
    pub fn remove(&self, key: &StreamKey) -> Option<Arc<BookHandle>> {
        self.books.write().remove(key)
    }

    /// Reader lookup. Missing entry just means the stream is not (yet) live.
    #[inline]
    pub fn get(&self, key: &StreamKey) -> Option<Arc<BookHandle>> {
        self.books.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }
}

/// Result of a volume-weighted walk over one book side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VwapFill {
    /// Average execution price over the filled target.
    pub avg_price: f64,
    /// Price of the last level touched.
    pub final_price: f64,
    /// Cash actually consumed (equals the target when the walk fills).
    pub cash_volume: f64,
}

/// Walk `levels` in the given order, consuming cash depth until
/// `target_cash` (quote currency) is filled. Returns `None` when the side's
/// total cash depth is below the target.
pub fn avg_price(levels: &[PriceLevel], target_cash: f64) -> Option<VwapFill> {
    if target_cash <= 0.0 {
        return None;
    }

    let mut remaining = target_cash;
    let mut units = 0.0;
    let mut cash = 0.0;

    for level in levels {
        let consumed = level.cash().min(remaining);
        units += consumed / level.price;
        cash += consumed;
        remaining -= consumed;

        if remaining <= 0.0 {
            return Some(VwapFill {
                avg_price: target_cash / units,
                final_price: level.price,
                cash_volume: cash,
            });
        }
    }

    None
}
