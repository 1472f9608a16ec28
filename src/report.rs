//! Scan reports and their consumers
//!
//! Every scan tick produces one [`ScanReport`] with the opportunities that
//! cleared the spread target, grouped by symbol. An empty report is still a
//! report; downstream consumers rely on the tick cadence to notice that an
//! opportunity went away.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::exchanges::{Exchange, MarketKind};

// =============================================================================
// RECORDS
// =============================================================================

/// Direction of the spot leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy spot, sell the future.
    Buy,
    /// Sell spot, buy the future back.
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// One executable side of an opportunity, priced by walking the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OpportunityLeg {
    pub exchange: Exchange,
    pub market: MarketKind,
    pub avg_price: f64,
    pub final_price: f64,
    pub cash_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpportunityRecord {
    pub side: Side,
    pub symbol: String,
    /// Depth-priced spread between the two final prices, percent.
    pub spread_pct: f64,
    /// Executable cash volume, the smaller of the two legs.
    pub volume: f64,
    /// Expected gain on `volume` at the two average prices.
    pub profit_estimate: f64,
    pub buy: OpportunityLeg,
    pub sell: OpportunityLeg,
}

/// One scan tick's findings, grouped by symbol.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub at: DateTime<Utc>,
    pub opportunities: BTreeMap<String, Vec<OpportunityRecord>>,
}

impl ScanReport {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            opportunities: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, record: OpportunityRecord) {
        self.opportunities
            .entry(record.symbol.clone())
            .or_default()
            .push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.opportunities.is_empty()
    }

    pub fn total(&self) -> usize {
        self.opportunities.values().map(Vec::len).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = &OpportunityRecord> {
        self.opportunities.values().flatten()
    }
}

// =============================================================================
// OPERATION TRACKER
// =============================================================================

/// An opportunity that stopped appearing in reports.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedOperation {
    pub side: Side,
    pub symbol: String,
    pub open_for: Duration,
    pub max_volume: f64,
    pub best_spread_pct: f64,
}

#[derive(Debug, Clone)]
struct OpenOperation {
    since: Instant,
    max_volume: f64,
    best_spread_pct: f64,
}

/// Collapses per-tick records into open/close transitions. An operation is
/// one (side, symbol) pair seen in consecutive reports; it closes on the
/// first report it is missing from.
#[derive(Debug, Default)]
pub struct OperationTracker {
    open: HashMap<(Side, String), OpenOperation>,
}

pub struct TrackerUpdate {
    pub opened: Vec<(Side, String)>,
    pub closed: Vec<ClosedOperation>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn observe_at(&mut self, now: Instant, report: &ScanReport) -> TrackerUpdate {
        let mut opened = Vec::new();

        for record in report.records() {
            let key = (record.side, record.symbol.clone());
            match self.open.get_mut(&key) {
                Some(op) => {
                    op.max_volume = op.max_volume.max(record.volume);
                    op.best_spread_pct = op.best_spread_pct.max(record.spread_pct);
                }
                None => {
                    self.open.insert(
                        key.clone(),
                        OpenOperation {
                            since: now,
                            max_volume: record.volume,
                            best_spread_pct: record.spread_pct,
                        },
                    );
                    opened.push(key);
                }
            }
        }

        let mut closed = Vec::new();
        self.open.retain(|(side, symbol), op| {
            let still_present = report
                .opportunities
                .get(symbol)
                .map(|records| records.iter().any(|r| r.side == *side))
                .unwrap_or(false);
            if !still_present {
                closed.push(ClosedOperation {
                    side: *side,
                    symbol: symbol.clone(),
                    open_for: now.saturating_duration_since(op.since),
                    max_volume: op.max_volume,
                    best_spread_pct: op.best_spread_pct,
                });
            }
            still_present
        });

        TrackerUpdate { opened, closed }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

// =============================================================================
// REPORTERS
// =============================================================================

/// Consumes every scan tick. Implementations must not block the scanner.
pub trait Reporter: Send + Sync {
    fn publish(&self, report: &ScanReport);
}

/// Logs opportunity transitions, with per-record detail at debug.
pub struct LogReporter {
    tracker: Mutex<OperationTracker>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self {
            tracker: Mutex::new(OperationTracker::new()),
        }
    }
}

impl Default for LogReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for LogReporter {
    fn publish(&self, report: &ScanReport) {
        for record in report.records() {
            debug!(
                "💰 {} {} spread {:.2}% volume ${:.2} profit ${:.2} ({} {} → {} {})",
                record.side,
                record.symbol,
                record.spread_pct,
                record.volume,
                record.profit_estimate,
                record.buy.exchange.name(),
                record.buy.market,
                record.sell.exchange.name(),
                record.sell.market,
            );
        }

        let update = self.tracker.lock().observe_at(Instant::now(), report);
        for (side, symbol) in &update.opened {
            info!("📈 {} {} opportunity opened", side, symbol);
        }
        for op in &update.closed {
            info!(
                "📉 {} {} closed after {} (max volume ${:.2}, best spread {:.2}%)",
                op.side,
                op.symbol,
                format_duration(op.open_for),
                op.max_volume,
                op.best_spread_pct,
            );
        }
    }
}

/// Fans reports out to a tokio broadcast channel. Lagging or absent
/// receivers are not the scanner's problem.
pub struct BroadcastReporter {
    tx: broadcast::Sender<ScanReport>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanReport> {
        self.tx.subscribe()
    }
}

impl Reporter for BroadcastReporter {
    fn publish(&self, report: &ScanReport) {
        let _ = self.tx.send(report.clone());
    }
}

/// Sends every report to each inner reporter in order.
pub struct FanoutReporter {
    inner: Vec<Arc<dyn Reporter>>,
}

impl FanoutReporter {
    pub fn new(inner: Vec<Arc<dyn Reporter>>) -> Self {
        Self { inner }
    }
}

impl Reporter for FanoutReporter {
    fn publish(&self, report: &ScanReport) {
        for reporter in &self.inner {
            reporter.publish(report);
        }
    }
}
