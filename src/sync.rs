//! Order book synchronization over diff streams
//!
//! One task per live stream, owning the connection end to end:
//! - buffer diffs while a REST snapshot is in flight, then replay them in
//!   arrival order against the snapshot and go ready
//! - validate update-sequence contiguity on every applied diff; any gap
//!   forces a close-and-resync, never a silent partial book
//! - retry snapshot fetches forever with jittered exponential backoff
//! - reconnect dropped connections after a fixed delay, unless the
//!   lifecycle manager requested the teardown
//!
//! The sequencing rules live in [`BookSync`], which is pure and owns no I/O;
//! the driver in [`run`] wires it to the venue.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::book::{BookHandle, BookView, DepthDiff, DepthSnapshot, LiveBook};
use crate::config::AppConfig;
use crate::exchanges::{DepthEvent, ParseError, StreamKey};
use crate::streams::StreamHandle;

// =============================================================================
// SYNC STATE MACHINE (PURE)
// =============================================================================

/// What became of one incoming diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Queued for replay; the snapshot has not landed yet.
    Buffered,
    /// Levels merged, cursor advanced.
    Applied,
    /// Entirely at or before the cursor.
    Discarded,
}

/// Snapshot verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Accepted { replayed: usize, discarded: usize },
    /// Snapshot predates the buffered stream, fetch a fresh one.
    Stale { snapshot_id: u64, first_pending: u64 },
}

/// Unrecoverable sequence faults. Fatal to the connection, not the stream:
/// the machine resets itself before reporting one, so a caller always
/// observes the clean pre-snapshot state afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desync {
    PendingOverflow { buffered: usize },
    ReplayGap { expected: u64, got: u64 },
    LiveGap { expected: u64, got: u64 },
}

/// Sequencing core for one stream's book.
pub struct BookSync {
    book: LiveBook,
    pending: VecDeque<DepthDiff>,
    max_pending: usize,
}

impl BookSync {
    pub fn new(max_pending: usize) -> Self {
        Self {
            book: LiveBook::new(),
            pending: VecDeque::new(),
            max_pending,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.book.ready
    }

    pub fn cursor(&self) -> u64 {
        self.book.sync_cursor
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn view(&self) -> BookView {
        self.book.view()
    }

    pub fn reset(&mut self) {
        self.book.reset();
        self.pending.clear();
    }

    /// Feed one diff from the stream, before or after readiness.
    pub fn on_diff(&mut self, diff: DepthDiff) -> Result<DiffOutcome, Desync> {
        if !self.book.ready {
            if self.pending.len() >= self.max_pending {
                let buffered = self.pending.len();
                self.reset();
                return Err(Desync::PendingOverflow { buffered });
            }
            self.pending.push_back(diff);
            return Ok(DiffOutcome::Buffered);
        }

        if diff.last_id <= self.book.sync_cursor {
            return Ok(DiffOutcome::Discarded);
        }
        if diff.first_id > self.book.sync_cursor + 1 {
            let expected = self.book.sync_cursor + 1;
            let got = diff.first_id;
            self.reset();
            return Err(Desync::LiveGap { expected, got });
        }

        self.book.apply_diff(&diff);
        Ok(DiffOutcome::Applied)
    }

    /// Feed the REST snapshot. On acceptance the buffered diffs are replayed
    /// in arrival order and the book goes ready.
    pub fn on_snapshot(&mut self, snapshot: &DepthSnapshot) -> Result<SnapshotOutcome, Desync> {
        if let Some(first) = self.pending.front() {
            if snapshot.last_id < first.first_id {
                return Ok(SnapshotOutcome::Stale {
                    snapshot_id: snapshot.last_id,
                    first_pending: first.first_id,
                });
            }
        }

        self.book.load_snapshot(snapshot);
        let mut replayed = 0;
        let mut discarded = 0;
        while let Some(diff) = self.pending.pop_front() {
            if diff.last_id <= self.book.sync_cursor {
                discarded += 1;
                continue;
            }
            if diff.first_id > self.book.sync_cursor + 1 {
                let expected = self.book.sync_cursor + 1;
                let got = diff.first_id;
                self.reset();
                return Err(Desync::ReplayGap { expected, got });
            }
            self.book.apply_diff(&diff);
            replayed += 1;
        }

        self.book.ready = true;
        Ok(SnapshotOutcome::Accepted {
            replayed,
            discarded,
        })
    }
}

// =============================================================================
// SNAPSHOT BACKOFF
// =============================================================================

/// Jittered exponential backoff for snapshot refetches. The progression
/// spans stale snapshots as well as fetch failures; a single accepted
/// snapshot resets it.
#[derive(Debug)]
pub struct SnapshotBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_factor: f64,
    attempt: u32,
}

impl SnapshotBackoff {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            base_ms: config.snapshot_backoff_base_ms,
            max_ms: config.snapshot_backoff_max_ms,
            jitter_factor: config.snapshot_backoff_jitter,
            attempt: 0,
        }
    }

    /// Compute the next wait with jitter
    pub fn next_delay(&mut self) -> Duration {
        let raw = (self.base_ms as f64) * 2f64.powi(self.attempt as i32);
        let capped = raw.min(self.max_ms as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * jitter_range;

        self.attempt += 1;
        Duration::from_millis((capped + jitter) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Process-wide synchronizer counters, shared by every stream task.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    connects: AtomicU64,
    desyncs: AtomicU64,
    snapshots: AtomicU64,
    snapshot_retries: AtomicU64,
    diffs_applied: AtomicU64,
    diffs_buffered: AtomicU64,
    diffs_discarded: AtomicU64,
    parse_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncStats {
    pub connects: u64,
    pub desyncs: u64,
    pub snapshots: u64,
    pub snapshot_retries: u64,
    pub diffs_applied: u64,
    pub diffs_buffered: u64,
    pub diffs_discarded: u64,
    pub parse_errors: u64,
}

impl SyncMetrics {
    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_desync(&self) {
        self.desyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_retry(&self) {
        self.snapshot_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_diff_applied(&self) {
        self.diffs_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_diff_buffered(&self) {
        self.diffs_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_diff_discarded(&self) {
        self.diffs_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            connects: self.connects.load(Ordering::Relaxed),
            desyncs: self.desyncs.load(Ordering::Relaxed),
            snapshots: self.snapshots.load(Ordering::Relaxed),
            snapshot_retries: self.snapshot_retries.load(Ordering::Relaxed),
            diffs_applied: self.diffs_applied.load(Ordering::Relaxed),
            diffs_buffered: self.diffs_buffered.load(Ordering::Relaxed),
            diffs_discarded: self.diffs_discarded.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// STREAM DRIVER
// =============================================================================

/// Everything one synchronizer task needs.
pub struct StreamContext {
    pub key: StreamKey,
    pub handle: Arc<StreamHandle>,
    pub book: Arc<BookHandle>,
    pub config: Arc<AppConfig>,
    pub http: reqwest::Client,
    pub metrics: Arc<SyncMetrics>,
}

/// Why one connection ended.
enum ConnectionEnd {
    /// Lifecycle manager asked for the close; do not reconnect.
    Teardown,
    /// Sequence fault; close sent, reconnect after the fixed delay.
    Desync,
    /// Venue closed or the stream drained.
    Remote,
}

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type SnapshotFuture = Pin<Box<dyn Future<Output = anyhow::Result<DepthSnapshot>> + Send>>;

/// Drive one stream until its handle is torn down. Reconnects forever on
/// venue faults with the configured fixed delay.
pub async fn run(ctx: StreamContext) {
    let mut machine = BookSync::new(ctx.config.max_pending_diffs);
    let mut backoff = SnapshotBackoff::new(&ctx.config);

    debug!("📡 {} synchronizer started", ctx.key);
    loop {
        if !ctx.handle.is_alive() {
            break;
        }

        ctx.metrics.record_connect();
        match connect_and_sync(&ctx, &mut machine, &mut backoff).await {
            Ok(ConnectionEnd::Teardown) => break,
            Ok(ConnectionEnd::Desync) => {
                // logged at the detection site
                ctx.book.mark_reset();
            }
            Ok(ConnectionEnd::Remote) => {
                ctx.book.mark_reset();
                warn!("🔌 {} depth stream closed by venue", ctx.key);
            }
            Err(err) => {
                ctx.book.mark_reset();
                warn!("❌ {} depth stream error: {:#}", ctx.key, err);
            }
        }

        if !ctx.handle.is_alive() {
            break;
        }
        tokio::time::sleep(ctx.config.reconnect_delay()).await;
    }
    debug!("👋 {} synchronizer stopped", ctx.key);
}

async fn connect_and_sync(
    ctx: &StreamContext,
    machine: &mut BookSync,
    backoff: &mut SnapshotBackoff,
) -> anyhow::Result<ConnectionEnd> {
    machine.reset();
    backoff.reset();

    let venue_symbol = ctx.key.venue_symbol();
    let url = ctx.key.exchange.depth_stream_url(ctx.key.market, &venue_symbol);
    let (ws_stream, _) = connect_async(&url).await.context("websocket connect")?;
    let (mut write, mut read) = ws_stream.split();

    if let Some(payload) = ctx
        .key
        .exchange
        .depth_subscribe_payload(ctx.key.market, &venue_symbol)
    {
        write
            .send(Message::Text(payload))
            .await
            .context("subscribe send")?;
    }
    let mut awaiting_ack = ctx.key.exchange.depth_requires_ack();

    debug!("🔗 {} depth stream connected", ctx.key);

    let mut close_rx = ctx.handle.subscribe_close();
    let mut snapshot_fut = fetch_snapshot(ctx, &venue_symbol, Duration::ZERO);
    let mut snapshot_armed = true;

    loop {
        tokio::select! {
            // wait_for also catches a close requested before this connection
            // subscribed; a dropped sender means the handle is gone, same thing
            _ = async { let _ = close_rx.wait_for(|requested| *requested).await; } => {
                let _ = write.send(close_message(CloseCode::Normal, "")).await;
                debug!("👋 {} teardown close", ctx.key);
                return Ok(ConnectionEnd::Teardown);
            }

            snapshot = &mut snapshot_fut, if snapshot_armed => {
                match snapshot {
                    Ok(snap) => match machine.on_snapshot(&snap) {
                        Ok(SnapshotOutcome::Accepted { replayed, discarded }) => {
                            ctx.metrics.record_snapshot();
                            backoff.reset();
                            snapshot_armed = false;
                            ctx.book.publish(machine.view(), true);
                            info!(
                                "✅ {} book synced (replayed {}, dropped {})",
                                ctx.key, replayed, discarded
                            );
                        }
                        Ok(SnapshotOutcome::Stale { snapshot_id, first_pending }) => {
                            ctx.metrics.record_snapshot_retry();
                            let delay = backoff.next_delay();
                            debug!(
                                "⏳ {} snapshot {} predates buffered {}, refetching in {:?}",
                                ctx.key, snapshot_id, first_pending, delay
                            );
                            snapshot_fut = fetch_snapshot(ctx, &venue_symbol, delay);
                        }
                        Err(desync) => {
                            return close_out_of_sync(ctx, &mut write, desync).await;
                        }
                    },
                    Err(err) => {
                        ctx.metrics.record_snapshot_retry();
                        let delay = backoff.next_delay();
                        warn!(
                            "⚠️ {} snapshot fetch failed ({:#}), retrying in {:?}",
                            ctx.key, err, delay
                        );
                        snapshot_fut = fetch_snapshot(ctx, &venue_symbol, delay);
                    }
                }
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => return Err(err).context("websocket read"),
                    None => return Ok(ConnectionEnd::Remote),
                };

                match msg {
                    Message::Text(text) => {
                        if let Some(end) =
                            on_frame(ctx, machine, &mut write, &mut awaiting_ack, text.as_bytes()).await?
                        {
                            return Ok(end);
                        }
                    }
                    Message::Binary(data) => {
                        if let Some(end) =
                            on_frame(ctx, machine, &mut write, &mut awaiting_ack, &data).await?
                        {
                            return Ok(end);
                        }
                    }
                    Message::Ping(data) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Message::Close(frame) => {
                        debug!("{} close frame from venue: {:?}", ctx.key, frame);
                        return Ok(ConnectionEnd::Remote);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Handle one data frame. `Ok(Some(end))` terminates the connection.
async fn on_frame(
    ctx: &StreamContext,
    machine: &mut BookSync,
    write: &mut WsWrite,
    awaiting_ack: &mut bool,
    payload: &[u8],
) -> anyhow::Result<Option<ConnectionEnd>> {
    match ctx.key.exchange.parse_depth_message(ctx.key.market, payload) {
        Ok(DepthEvent::Diff(diff)) => {
            *awaiting_ack = false;
            match machine.on_diff(diff) {
                Ok(DiffOutcome::Applied) => {
                    ctx.metrics.record_diff_applied();
                    ctx.book.publish(machine.view(), true);
                }
                Ok(DiffOutcome::Buffered) => ctx.metrics.record_diff_buffered(),
                Ok(DiffOutcome::Discarded) => ctx.metrics.record_diff_discarded(),
                Err(desync) => {
                    return close_out_of_sync(ctx, write, desync).await.map(Some);
                }
            }
            Ok(None)
        }
        Ok(DepthEvent::Ack(ack)) => {
            if *awaiting_ack {
                if !ack.success {
                    anyhow::bail!("subscription refused: {}", ack.detail);
                }
                *awaiting_ack = false;
                debug!("📬 {} subscription confirmed", ctx.key);
            }
            Ok(None)
        }
        // Pings and channel chatter are not data
        Err(ParseError::ControlMessage) => Ok(None),
        Err(err) => {
            ctx.metrics.record_parse_error();
            debug!("{} dropped unparsable frame: {:?}", ctx.key, err);
            Ok(None)
        }
    }
}

async fn close_out_of_sync(
    ctx: &StreamContext,
    write: &mut WsWrite,
    desync: Desync,
) -> anyhow::Result<ConnectionEnd> {
    ctx.metrics.record_desync();
    warn!("⚠️ {} out of sync: {:?}", ctx.key, desync);
    let _ = write.send(close_message(CloseCode::Away, "out of sync")).await;
    Ok(ConnectionEnd::Desync)
}

fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// One snapshot attempt, delayed by the current backoff. Every failure mode
/// (I/O, status, decode) surfaces as a retryable error.
fn fetch_snapshot(ctx: &StreamContext, venue_symbol: &str, delay: Duration) -> SnapshotFuture {
    let url = ctx
        .key
        .exchange
        .depth_snapshot_url(ctx.key.market, venue_symbol, ctx.config.snapshot_depth);
    let exchange = ctx.key.exchange;
    let market = ctx.key.market;
    let http = ctx.http.clone();

    Box::pin(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let response = http.get(&url).send().await.context("snapshot request")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("snapshot status {} from {}", status, url);
        }
        let body = response.bytes().await.context("snapshot body")?;
        exchange
            .parse_depth_snapshot(market, &body)
            .map_err(|e| anyhow::anyhow!("snapshot decode failed: {:?}", e))
    })
}
