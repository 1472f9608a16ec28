//! Lucro - cross-exchange spot/future spread scanner
//!
//! Tick feeds watch every cross-listed symbol for free; order book streams
//! are opened on demand and evicted when the spread goes quiet.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lucro::adjacency::AdjacencyMap;
use lucro::book::BookStore;
use lucro::catalog::MarketCatalog;
use lucro::config::AppConfig;
use lucro::report::{BroadcastReporter, FanoutReporter, LogReporter, Reporter};
use lucro::scanner::Scanner;
use lucro::streams::{StreamManager, SyncDriver};
use lucro::sync::SyncMetrics;
use lucro::tick_feed;
use lucro::ticks::TickStore;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 Lucro spread scanner starting");

    let config = Arc::new(AppConfig::from_env());
    info!(
        "🎯 target spread {:.2}% at ${:.0} volume, scanning every {}ms",
        config.target_spread_pct, config.target_volume, config.scan_interval_ms
    );

    let mut catalog = MarketCatalog::load(&config.markets_file)?;
    catalog.retain_cross_listed();
    if catalog.is_empty() {
        anyhow::bail!("no cross-listed symbols to scan, check {}", config.markets_file);
    }

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("Failed to build HTTP client")?;

    let ticks = Arc::new(TickStore::new(&catalog));
    let books = Arc::new(BookStore::new());
    let metrics = Arc::new(SyncMetrics::default());
    let streams = StreamManager::new(
        books.clone(),
        config.clone(),
        http,
        metrics.clone(),
        Arc::new(SyncDriver),
    );

    let adjacency = AdjacencyMap::build(&catalog);
    info!(
        "📊 scanning {} spot/future pairs across {} symbols",
        adjacency.pair_count(),
        catalog.symbol_count()
    );

    let _feed_handles = tick_feed::spawn_feeds(&catalog, &ticks, &config);

    // Reports go to the log and to anyone holding a broadcast receiver
    let broadcast = Arc::new(BroadcastReporter::new(256));
    let _report_rx = broadcast.subscribe();
    let reporters: Vec<Arc<dyn Reporter>> = vec![Arc::new(LogReporter::new()), broadcast];
    let reporter = Arc::new(FanoutReporter::new(reporters));

    let scanner = Scanner::new(
        adjacency,
        ticks,
        books,
        streams.clone(),
        reporter,
        config.clone(),
    );
    tokio::spawn(scanner.run());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let stats = metrics.stats();
            info!(
                "📊 sync: {} live streams, {} connects, {} desyncs, {} snapshots ({} retries), {} diffs applied, {} parse errors",
                streams.stream_count(),
                stats.connects,
                stats.desyncs,
                stats.snapshots,
                stats.snapshot_retries,
                stats.diffs_applied,
                stats.parse_errors,
            );
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("👋 shutting down");

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lucro=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the manifest directory, for runs with --manifest-path
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
