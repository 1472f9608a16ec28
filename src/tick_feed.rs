//! Last-trade price feeds
//!
//! One websocket task per (exchange, market), subscribed to every
//! cross-listed symbol at once. Each trade overwrites the symbol's slot in
//! the [`TickStore`]; nobody waits on these feeds, the scanner just reads
//! whatever price is there. Feeds reconnect forever and never tear down.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::catalog::MarketCatalog;
use crate::config::AppConfig;
use crate::exchanges::{Exchange, MarketKind, ParseError};
use crate::ticks::{TickSlot, TickStore};

/// Launch every feed the catalog calls for. The handles run for the life
/// of the process.
pub fn spawn_feeds(
    catalog: &MarketCatalog,
    ticks: &Arc<TickStore>,
    config: &Arc<AppConfig>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for (exchange, market, symbols) in catalog.feeds() {
        let venue_symbols: Vec<String> = symbols
            .iter()
            .map(|s| exchange.venue_symbol(s))
            .collect();
        let slots = venue_slot_map(exchange, market, ticks);

        info!(
            "🚀 {} {} tick feed: {} symbols",
            exchange.name(),
            market,
            venue_symbols.len()
        );
        handles.push(tokio::spawn(run_feed(
            exchange,
            market,
            venue_symbols,
            slots,
            config.clone(),
        )));
    }

    handles
}

/// Slots keyed by the venue's own symbol spelling, as it appears in trade
/// messages.
fn venue_slot_map(
    exchange: Exchange,
    market: MarketKind,
    ticks: &TickStore,
) -> HashMap<String, Arc<TickSlot>> {
    ticks
        .slots_for(exchange, market)
        .map(|(symbol, slot)| (exchange.venue_symbol(symbol), slot))
        .collect()
}

async fn run_feed(
    exchange: Exchange,
    market: MarketKind,
    venue_symbols: Vec<String>,
    slots: HashMap<String, Arc<TickSlot>>,
    config: Arc<AppConfig>,
) {
    loop {
        match stream_ticks(exchange, market, &venue_symbols, &slots).await {
            Ok(()) => warn!("🔌 {} {} tick feed closed by venue", exchange.name(), market),
            Err(err) => warn!("❌ {} {} tick feed error: {:#}", exchange.name(), market, err),
        }
        tokio::time::sleep(config.reconnect_delay()).await;
    }
}

async fn stream_ticks(
    exchange: Exchange,
    market: MarketKind,
    venue_symbols: &[String],
    slots: &HashMap<String, Arc<TickSlot>>,
) -> anyhow::Result<()> {
    let url = exchange.tick_stream_url(market, venue_symbols);
    let (ws_stream, _) = connect_async(&url).await.context("websocket connect")?;
    let (mut write, mut read) = ws_stream.split();

    if let Some(payload) = exchange.tick_subscribe_payload(market, venue_symbols) {
        write
            .send(Message::Text(payload))
            .await
            .context("subscribe send")?;
    }
    let mut awaiting_ack = exchange.tick_requires_ack();

    debug!("🔗 {} {} tick feed connected", exchange.name(), market);

    let mut parse_buffer: Vec<u8> = Vec::with_capacity(8 * 1024);
    while let Some(msg) = read.next().await {
        let msg = msg.context("websocket read")?;
        let payload: &[u8] = match &msg {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
            Message::Ping(data) => {
                let _ = write.send(Message::Pong(data.clone())).await;
                continue;
            }
            Message::Close(_) => return Ok(()),
            _ => continue,
        };

        if awaiting_ack {
            if let Ok(ack) = exchange.parse_subscribe_ack(payload) {
                awaiting_ack = false;
                if !ack.success {
                    anyhow::bail!("subscription refused: {}", ack.detail);
                }
                debug!("📬 {} {} subscription confirmed", exchange.name(), market);
                continue;
            }
        }

        // simd-json parses in place, so work on a scratch copy
        parse_buffer.clear();
        parse_buffer.extend_from_slice(payload);
        match exchange.parse_ticks(market, &mut parse_buffer, |symbol, price| {
            if let Some(slot) = slots.get(symbol) {
                slot.store(price);
            }
        }) {
            Ok(_) => {}
            Err(ParseError::ControlMessage) => {}
            Err(err) => {
                debug!(
                    "{} {} dropped unparsable tick frame: {:?}",
                    exchange.name(),
                    market,
                    err
                );
            }
        }
    }

    Ok(())
}
