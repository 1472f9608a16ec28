//! Demand-driven stream lifecycle
//!
//! Streams exist only while something keeps asking for them. The scanner
//! calls [`StreamManager::keep_alive`] every time a pair looks interesting;
//! the first call launches a synchronizer task, later calls just renew the
//! idle deadline. A stream that goes unrenewed for the idle window is
//! evicted exactly once: marked closing, dropped from the registry and the
//! book store, and told to send a normal close.
//!
//! A `keep_alive` that lands while the old stream is still tearing down
//! creates a fresh, independent handle; the leftover teardown cannot touch it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::book::BookStore;
use crate::config::AppConfig;
use crate::exchanges::StreamKey;
use crate::sync::{self, StreamContext, SyncMetrics};

// =============================================================================
// STREAM HANDLE
// =============================================================================

/// Shared state for one live stream. The manager, the reaper, and the
/// synchronizer task all hold the same `Arc`.
pub struct StreamHandle {
    key: StreamKey,
    alive: AtomicBool,
    closing: AtomicBool,
    last_renewed: Mutex<Instant>,
    close_tx: watch::Sender<bool>,
}

impl StreamHandle {
    fn new(key: StreamKey) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            key,
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            last_renewed: Mutex::new(Instant::now()),
            close_tx,
        })
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Push the idle deadline out again.
    pub fn renew(&self) {
        *self.last_renewed.lock() = Instant::now();
    }

    pub fn last_renewed(&self) -> Instant {
        *self.last_renewed.lock()
    }

    /// First caller wins; everyone else sees the stream as already closing.
    fn begin_close(&self) -> bool {
        self.closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Tell the synchronizer to send a normal close and stop reconnecting.
    fn request_close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.close_tx.send(true);
    }

    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

// =============================================================================
// DRIVER SEAM
// =============================================================================

/// Launches the network task for a freshly created stream.
pub trait StreamDriver: Send + Sync {
    fn launch(&self, ctx: StreamContext);
}

/// Production driver: one synchronizer task per stream.
pub struct SyncDriver;

impl StreamDriver for SyncDriver {
    fn launch(&self, ctx: StreamContext) {
        tokio::spawn(sync::run(ctx));
    }
}

// =============================================================================
// STREAM MANAGER
// =============================================================================

pub struct StreamManager {
    streams: RwLock<HashMap<StreamKey, Arc<StreamHandle>>>,
    books: Arc<BookStore>,
    config: Arc<AppConfig>,
    http: reqwest::Client,
    metrics: Arc<SyncMetrics>,
    driver: Arc<dyn StreamDriver>,
}

impl StreamManager {
    pub fn new(
        books: Arc<BookStore>,
        config: Arc<AppConfig>,
        http: reqwest::Client,
        metrics: Arc<SyncMetrics>,
        driver: Arc<dyn StreamDriver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::with_capacity(64)),
            books,
            config,
            http,
            metrics,
            driver,
        })
    }

    /// Renew the stream for `key`, creating it if absent or mid-teardown.
    /// Called every scan tick for every interesting pair, so the renewal
    /// path takes only a read lock.
    pub fn keep_alive(self: &Arc<Self>, key: &StreamKey) {
        {
            let streams = self.streams.read();
            if let Some(handle) = streams.get(key) {
                if !handle.is_closing() {
                    handle.renew();
                    return;
                }
            }
        }

        let mut streams = self.streams.write();
        // another tick may have created it between the locks
        if let Some(handle) = streams.get(key) {
            if !handle.is_closing() {
                handle.renew();
                return;
            }
        }

        let handle = StreamHandle::new(key.clone());
        streams.insert(key.clone(), handle.clone());
        let book = self.books.insert(key.clone());
        drop(streams);

        info!("🚀 launching {} depth stream", key);
        self.driver.launch(StreamContext {
            key: key.clone(),
            handle: handle.clone(),
            book,
            config: self.config.clone(),
            http: self.http.clone(),
            metrics: self.metrics.clone(),
        });
        tokio::spawn(idle_reaper(
            Arc::downgrade(self),
            handle,
            self.config.idle_timeout(),
        ));
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    pub fn handle(&self, key: &StreamKey) -> Option<Arc<StreamHandle>> {
        self.streams.read().get(key).cloned()
    }
}

/// Watches one handle's idle deadline and evicts it when the window passes
/// with no renewal. The registry is only touched if it still holds this
/// exact handle; a fresh replacement created mid-teardown stays untouched.
async fn idle_reaper(manager: Weak<StreamManager>, handle: Arc<StreamHandle>, timeout: Duration) {
    loop {
        let deadline = handle.last_renewed() + timeout;
        tokio::time::sleep_until(deadline).await;

        if handle.last_renewed() + timeout > Instant::now() {
            continue;
        }

        if !handle.begin_close() {
            return;
        }

        let key = handle.key().clone();
        if let Some(manager) = manager.upgrade() {
            let mut streams = manager.streams.write();
            let still_current = streams
                .get(&key)
                .map(|current| Arc::ptr_eq(current, &handle))
                .unwrap_or(false);
            if still_current {
                streams.remove(&key);
                manager.books.remove(&key);
            }
            drop(streams);
            info!("👋 {} idle for {:?}, closing stream", key, timeout);
        } else {
            debug!("{} reaper outlived its manager", key);
        }

        handle.request_close();
        return;
    }
}
