//! Integration tests for the scan pipeline
//!
//! These drive the library end to end without touching the network: books
//! advance through the public sync machine, stream lifecycle runs against a
//! stub driver under paused time, and reports come back over the broadcast
//! channel exactly as a downstream consumer would see them.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use lucro::adjacency::AdjacencyMap;
use lucro::book::{BookStore, DepthDiff, DepthSnapshot, PriceLevel};
use lucro::catalog::MarketCatalog;
use lucro::config::AppConfig;
use lucro::report::{BroadcastReporter, Side};
use lucro::scanner::Scanner;
use lucro::streams::{StreamDriver, StreamManager};
use lucro::sync::{BookSync, Desync, DiffOutcome, SnapshotOutcome, StreamContext, SyncMetrics};
use lucro::ticks::TickStore;
use lucro::{Exchange, MarketKind, StreamKey};

fn level(price: f64, size: f64) -> PriceLevel {
    PriceLevel::new(price, size)
}

/// Records every launch instead of opening sockets.
struct RecordingDriver {
    launched: Mutex<Vec<StreamKey>>,
}

impl RecordingDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            launched: Mutex::new(Vec::new()),
        })
    }

    fn launches(&self) -> Vec<StreamKey> {
        self.launched.lock().clone()
    }
}

impl StreamDriver for RecordingDriver {
    fn launch(&self, ctx: StreamContext) {
        self.launched.lock().push(ctx.key.clone());
    }
}

fn manager_with(
    driver: Arc<RecordingDriver>,
    config: Arc<AppConfig>,
) -> (Arc<StreamManager>, Arc<BookStore>) {
    let books = Arc::new(BookStore::new());
    let manager = StreamManager::new(
        books.clone(),
        config,
        reqwest::Client::new(),
        Arc::new(SyncMetrics::default()),
        driver,
    );
    (manager, books)
}

// =============================================================================
// BOOK SYNC LIFECYCLE
// =============================================================================

#[test]
fn test_book_sync_full_lifecycle() {
    let mut sync = BookSync::new(1000);

    // Diffs arrive while the snapshot request is in flight
    let early = DepthDiff {
        first_id: 101,
        last_id: 102,
        bids: vec![level(99.5, 2.0)],
        asks: vec![],
    };
    assert_eq!(sync.on_diff(early.clone()).unwrap(), DiffOutcome::Buffered);

    // First snapshot predates the buffer, gets thrown away
    let stale = DepthSnapshot {
        last_id: 95,
        bids: vec![],
        asks: vec![],
    };
    assert_eq!(
        sync.on_snapshot(&stale).unwrap(),
        SnapshotOutcome::Stale {
            snapshot_id: 95,
            first_pending: 101
        }
    );

    // The refetched snapshot covers the buffer start and goes live
    let fresh = DepthSnapshot {
        last_id: 101,
        bids: vec![level(100.0, 1.0)],
        asks: vec![level(101.0, 1.0)],
    };
    assert_eq!(
        sync.on_snapshot(&fresh).unwrap(),
        SnapshotOutcome::Accepted {
            replayed: 1,
            discarded: 0
        }
    );
    assert!(sync.is_ready());
    assert_eq!(sync.cursor(), 102);
    assert_eq!(sync.view().bids, vec![level(100.0, 1.0), level(99.5, 2.0)]);

    // Live stream: one delete, one new ask, strictly contiguous
    let live = DepthDiff {
        first_id: 103,
        last_id: 104,
        bids: vec![level(100.0, 0.0)],
        asks: vec![level(101.5, 3.0)],
    };
    assert_eq!(sync.on_diff(live).unwrap(), DiffOutcome::Applied);
    assert_eq!(sync.view().bids, vec![level(99.5, 2.0)]);
    assert_eq!(sync.view().asks, vec![level(101.0, 1.0), level(101.5, 3.0)]);

    // Replays of old ids are harmless
    assert_eq!(sync.on_diff(early).unwrap(), DiffOutcome::Discarded);

    // A hole in the sequence kills the book outright
    let gapped = DepthDiff {
        first_id: 110,
        last_id: 111,
        bids: vec![],
        asks: vec![],
    };
    assert_eq!(
        sync.on_diff(gapped).unwrap_err(),
        Desync::LiveGap {
            expected: 105,
            got: 110
        }
    );
    assert!(!sync.is_ready());
    assert!(sync.view().bids.is_empty());

    // Same machine resyncs cleanly on the next connection
    sync.on_diff(DepthDiff {
        first_id: 201,
        last_id: 202,
        bids: vec![level(98.0, 1.0)],
        asks: vec![],
    })
    .unwrap();
    let resync = DepthSnapshot {
        last_id: 201,
        bids: vec![level(97.0, 4.0)],
        asks: vec![level(103.0, 4.0)],
    };
    assert_eq!(
        sync.on_snapshot(&resync).unwrap(),
        SnapshotOutcome::Accepted {
            replayed: 1,
            discarded: 0
        }
    );
    assert_eq!(sync.view().bids, vec![level(98.0, 1.0), level(97.0, 4.0)]);
}

// =============================================================================
// LIFECYCLE AGAINST A STUB DRIVER
// =============================================================================

#[tokio::test]
async fn test_keep_alive_launches_once_per_stream() {
    let driver = RecordingDriver::new();
    let (manager, books) = manager_with(driver.clone(), Arc::new(AppConfig::default()));

    let spot = StreamKey::new(Exchange::Binance, MarketKind::Spot, "ETH");
    let future = StreamKey::new(Exchange::Gate, MarketKind::Future, "ETH");

    manager.keep_alive(&spot);
    manager.keep_alive(&spot);
    manager.keep_alive(&future);
    manager.keep_alive(&spot);

    assert_eq!(driver.launches(), vec![spot.clone(), future.clone()]);
    assert_eq!(manager.stream_count(), 2);
    assert!(books.get(&spot).is_some());
    assert!(books.get(&future).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_eviction_then_relaunch_uses_a_fresh_stream() {
    let driver = RecordingDriver::new();
    let (manager, books) = manager_with(driver.clone(), Arc::new(AppConfig::default()));
    let key = StreamKey::new(Exchange::Binance, MarketKind::Spot, "ETH");

    manager.keep_alive(&key);
    let first = manager.handle(&key).unwrap();
    let first_book = books.get(&key).unwrap();

    // Idle window passes with no renewals
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(!first.is_alive());
    assert_eq!(manager.stream_count(), 0);
    assert!(books.get(&key).is_none());

    // Interest returns: a brand new stream and a brand new book
    manager.keep_alive(&key);
    let second = manager.handle(&key).unwrap();
    let second_book = books.get(&key).unwrap();

    assert_eq!(driver.launches().len(), 2);
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first_book, &second_book));
    assert!(second.is_alive());
}

// =============================================================================
// SCANNER TO BROADCAST CONSUMER
// =============================================================================

fn pipeline_catalog() -> MarketCatalog {
    serde_json::from_str(
        r#"{"binance":{"spot":["ETH"],"future":[]},"gate":{"spot":[],"future":["ETH"]}}"#,
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_scanner_reports_reach_broadcast_subscribers() {
    let catalog = pipeline_catalog();
    let mut config = AppConfig::default();
    config.target_spread_pct = 2.0;
    let config = Arc::new(config);

    let driver = RecordingDriver::new();
    let (streams, books) = manager_with(driver.clone(), config.clone());
    let ticks = Arc::new(TickStore::new(&catalog));

    let broadcast = Arc::new(BroadcastReporter::new(16));
    let mut rx = broadcast.subscribe();

    let scanner = Scanner::new(
        AdjacencyMap::build(&catalog),
        ticks.clone(),
        books.clone(),
        streams.clone(),
        broadcast.clone(),
        config,
    );

    let spot_key = StreamKey::new(Exchange::Binance, MarketKind::Spot, "ETH");
    let future_key = StreamKey::new(Exchange::Gate, MarketKind::Future, "ETH");

    ticks
        .slot(Exchange::Binance, MarketKind::Spot, "ETH")
        .unwrap()
        .store(100.0);
    ticks
        .slot(Exchange::Gate, MarketKind::Future, "ETH")
        .unwrap()
        .store(103.0);

    let task = tokio::spawn(scanner.run());

    // First tick: streams get armed, nothing to report yet
    let report = rx.recv().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(streams.stream_count(), 2);

    // The books come up between ticks
    books.get(&spot_key).unwrap().publish(
        lucro::BookView {
            bids: vec![level(99.0, 10.0)],
            asks: vec![level(100.0, 5.0), level(101.0, 5.0)],
            sequence: 7,
        },
        true,
    );
    books.get(&future_key).unwrap().publish(
        lucro::BookView {
            bids: vec![level(103.0, 5.0), level(102.0, 5.0)],
            asks: vec![level(104.0, 10.0)],
            sequence: 9,
        },
        true,
    );

    // Next tick prices the books and reports the edge
    let report = rx.recv().await.unwrap();
    assert_eq!(report.total(), 1);
    let record = &report.opportunities["ETH"][0];
    assert_eq!(record.side, Side::Buy);
    assert_eq!(record.spread_pct, 2.91);
    assert_eq!(record.volume, 500.0);
    assert!((record.profit_estimate - 15.0).abs() < 1e-9);

    // The edge evaporates on the tick side: empty reports keep flowing
    ticks
        .slot(Exchange::Gate, MarketKind::Future, "ETH")
        .unwrap()
        .store(100.0);
    let report = rx.recv().await.unwrap();
    assert!(report.is_empty());

    task.abort();
}

// =============================================================================
// CATALOG TO TICK SLOTS
// =============================================================================

#[test]
fn test_catalog_file_to_scannable_universe() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "binance": {{"spot": ["ETH", "SOL", "DOGE"], "future": ["ETH", "TST"]}},
            "gate": {{"spot": ["TST"], "future": ["SOL", "ETH"]}}
        }}"#
    )
    .unwrap();

    let mut catalog = MarketCatalog::load(file.path()).unwrap();
    catalog.retain_cross_listed();

    // ETH and SOL are listed spot somewhere and future somewhere; DOGE has
    // no future anywhere and TST is excluded outright.
    let ticks = TickStore::new(&catalog);
    assert!(ticks
        .slot(Exchange::Binance, MarketKind::Spot, "ETH")
        .is_some());
    assert!(ticks
        .slot(Exchange::Binance, MarketKind::Spot, "SOL")
        .is_some());
    assert!(ticks
        .slot(Exchange::Binance, MarketKind::Spot, "DOGE")
        .is_none());
    assert!(ticks
        .slot(Exchange::Gate, MarketKind::Future, "ETH")
        .is_some());
    assert!(ticks.slot(Exchange::Gate, MarketKind::Spot, "TST").is_none());

    let adjacency = AdjacencyMap::build(&catalog);
    // Binance spot ETH pairs with both future venues, SOL with Gate only
    assert_eq!(adjacency.pair_count(), 3);
}
