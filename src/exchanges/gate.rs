//! Gate.io wire formats: spot + USDT-settled perpetuals.
//!
//! Both markets use one shared WebSocket endpoint per API family; streams
//! are opened by a subscribe request and confirmed by an ack frame that
//! must be checked before any update is trusted. Spot depth levels are
//! `["price","amount"]` string pairs; futures levels are `{"p","s"}`
//! objects with the size as a bare number of contracts.

use serde::Deserialize;

use crate::book::{DepthDiff, DepthSnapshot, PriceLevel};
use crate::exchanges::{DepthEvent, MarketKind, ParseError, SubscribeAck};

const SPOT_WS_URL: &str = "wss://api.gateio.ws/ws/v4/";
const FUTURES_WS_URL: &str = "wss://fx-ws.gateio.ws/v4/ws/usdt";
const REST_BASE: &str = "https://api.gateio.ws/api/v4";

// =============================================================================
// URLS & SUBSCRIBE REQUESTS
// =============================================================================

pub fn ws_url(market: MarketKind) -> &'static str {
    match market {
        MarketKind::Spot => SPOT_WS_URL,
        MarketKind::Future => FUTURES_WS_URL,
    }
}

pub fn depth_snapshot_url(market: MarketKind, venue_symbol: &str, depth: u32) -> String {
    match market {
        MarketKind::Spot => format!(
            "{}/spot/order_book?currency_pair={}&limit={}&with_id=true",
            REST_BASE, venue_symbol, depth
        ),
        MarketKind::Future => format!(
            "{}/futures/usdt/order_book?contract={}&limit={}&with_id=true",
            REST_BASE, venue_symbol, depth
        ),
    }
}

pub fn depth_subscribe_payload(market: MarketKind, venue_symbol: &str) -> String {
    let channel = match market {
        MarketKind::Spot => "spot.order_book_update",
        MarketKind::Future => "futures.order_book_update",
    };
    serde_json::json!({
        "time": chrono::Utc::now().timestamp(),
        "channel": channel,
        "event": "subscribe",
        "payload": [venue_symbol, "100ms"],
    })
    .to_string()
}

/// One subscription covers every symbol; trades for the whole venue share
/// the connection.
pub fn tick_subscribe_payload(market: MarketKind, venue_symbols: &[String]) -> String {
    let channel = match market {
        MarketKind::Spot => "spot.trades",
        MarketKind::Future => "futures.trades",
    };
    serde_json::json!({
        "time": chrono::Utc::now().timestamp(),
        "channel": channel,
        "event": "subscribe",
        "payload": venue_symbols,
    })
    .to_string()
}

// =============================================================================
// ACK & DEPTH PARSING
// =============================================================================

/// Parse the ack Gate sends in response to a subscribe request. A present
/// `error` object or a non-"success" status means the stream never opened.
pub fn parse_subscribe_ack(payload: &[u8]) -> Result<SubscribeAck, ParseError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|_| ParseError::InvalidJson)?;
    let obj = value.as_object().ok_or(ParseError::NotObject)?;

    if obj.get("event").and_then(|v| v.as_str()) != Some("subscribe") {
        return Err(ParseError::ControlMessage);
    }

    if let Some(error) = obj.get("error").filter(|e| !e.is_null()) {
        let detail = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("subscribe refused")
            .to_string();
        return Ok(SubscribeAck {
            success: false,
            detail,
        });
    }

    let status = obj
        .get("result")
        .and_then(|r| r.get("status"))
        .and_then(|v| v.as_str())
        .unwrap_or("success");
    Ok(SubscribeAck {
        success: status == "success",
        detail: status.to_string(),
    })
}

/// Parse one depth-channel frame.
/// Spot update result: {"t":...,"e":"depthUpdate","s":"BTC_USDT","U":157,
///   "u":160,"b":[["19137.74","0.0001"]],"a":[...]}
/// Futures update result: {"t":...,"s":"BTC_USDT","U":157,"u":160,
///   "b":[{"p":"54672.1","s":0}],"a":[...]}
pub fn parse_depth_message(market: MarketKind, payload: &[u8]) -> Result<DepthEvent, ParseError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|_| ParseError::InvalidJson)?;
    let obj = value.as_object().ok_or(ParseError::NotObject)?;

    match obj.get("event").and_then(|v| v.as_str()) {
        Some("update") => {}
        Some("subscribe") => return parse_subscribe_ack(payload).map(DepthEvent::Ack),
        // Pings and channel chatter
        _ => return Err(ParseError::ControlMessage),
    }

    let result = obj
        .get("result")
        .and_then(|v| v.as_object())
        .ok_or(ParseError::MissingField("result"))?;
    let first_id = result
        .get("U")
        .and_then(|v| v.as_u64())
        .ok_or(ParseError::MissingField("U"))?;
    let last_id = result
        .get("u")
        .and_then(|v| v.as_u64())
        .ok_or(ParseError::MissingField("u"))?;

    let (bids, asks) = match market {
        MarketKind::Spot => (
            parse_pair_levels(result, "b")?,
            parse_pair_levels(result, "a")?,
        ),
        MarketKind::Future => (
            parse_contract_levels(result, "b")?,
            parse_contract_levels(result, "a")?,
        ),
    };

    Ok(DepthEvent::Diff(DepthDiff {
        first_id,
        last_id,
        bids,
        asks,
    }))
}

fn parse_pair_levels(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &'static str,
) -> Result<Vec<PriceLevel>, ParseError> {
    let entries = obj
        .get(field)
        .and_then(|v| v.as_array())
        .ok_or(ParseError::MissingField(field))?;

    let mut levels = Vec::with_capacity(entries.len());
    for entry in entries {
        let pair = entry.as_array().ok_or(ParseError::InvalidNumber)?;
        let price_str = pair
            .first()
            .and_then(|v| v.as_str())
            .ok_or(ParseError::InvalidNumber)?;
        let size_str = pair
            .get(1)
            .and_then(|v| v.as_str())
            .ok_or(ParseError::InvalidNumber)?;
        levels.push(PriceLevel {
            price: fast_float::parse(price_str).map_err(|_| ParseError::InvalidNumber)?,
            size: fast_float::parse(size_str).map_err(|_| ParseError::InvalidNumber)?,
        });
    }
    Ok(levels)
}

fn parse_contract_levels(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &'static str,
) -> Result<Vec<PriceLevel>, ParseError> {
    let entries = obj
        .get(field)
        .and_then(|v| v.as_array())
        .ok_or(ParseError::MissingField(field))?;

    let mut levels = Vec::with_capacity(entries.len());
    for entry in entries {
        let price_str = entry
            .get("p")
            .and_then(|v| v.as_str())
            .ok_or(ParseError::MissingField("p"))?;
        let size = entry
            .get("s")
            .and_then(|v| v.as_f64())
            .ok_or(ParseError::MissingField("s"))?;
        levels.push(PriceLevel {
            price: fast_float::parse(price_str).map_err(|_| ParseError::InvalidNumber)?,
            size,
        });
    }
    Ok(levels)
}

// =============================================================================
// REST SNAPSHOTS
// =============================================================================

#[derive(Debug, Deserialize)]
struct SpotBook {
    id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct ContractLevel {
    p: String,
    s: f64,
}

#[derive(Debug, Deserialize)]
struct ContractBook {
    id: u64,
    bids: Vec<ContractLevel>,
    asks: Vec<ContractLevel>,
}

pub fn parse_depth_snapshot(market: MarketKind, body: &[u8]) -> Result<DepthSnapshot, ParseError> {
    match market {
        MarketKind::Spot => {
            let book: SpotBook =
                serde_json::from_slice(body).map_err(|_| ParseError::InvalidJson)?;
            Ok(DepthSnapshot {
                last_id: book.id,
                bids: convert_pairs(&book.bids)?,
                asks: convert_pairs(&book.asks)?,
            })
        }
        MarketKind::Future => {
            let book: ContractBook =
                serde_json::from_slice(body).map_err(|_| ParseError::InvalidJson)?;
            Ok(DepthSnapshot {
                last_id: book.id,
                bids: convert_contracts(&book.bids)?,
                asks: convert_contracts(&book.asks)?,
            })
        }
    }
}

fn convert_pairs(entries: &[[String; 2]]) -> Result<Vec<PriceLevel>, ParseError> {
    entries
        .iter()
        .map(|[price, size]| {
            Ok(PriceLevel {
                price: fast_float::parse(price).map_err(|_| ParseError::InvalidNumber)?,
                size: fast_float::parse(size).map_err(|_| ParseError::InvalidNumber)?,
            })
        })
        .collect()
}

fn convert_contracts(entries: &[ContractLevel]) -> Result<Vec<PriceLevel>, ParseError> {
    entries
        .iter()
        .map(|l| {
            Ok(PriceLevel {
                price: fast_float::parse(&l.p).map_err(|_| ParseError::InvalidNumber)?,
                size: l.s,
            })
        })
        .collect()
}

// =============================================================================
// TICK PARSING (SIMD-JSON)
// =============================================================================

/// Parse one trades-channel frame. Spot delivers a single trade object per
/// frame; futures delivers an array.
#[inline]
pub fn parse_ticks(
    market: MarketKind,
    payload: &mut [u8],
    mut sink: impl FnMut(&str, f64),
) -> Result<usize, ParseError> {
    use simd_json::prelude::*;

    let value = simd_json::to_borrowed_value(payload).map_err(|_| ParseError::InvalidJson)?;
    let obj = value.as_object().ok_or(ParseError::NotObject)?;

    if obj.get("event").and_then(|v| v.as_str()) != Some("update") {
        return Err(ParseError::ControlMessage);
    }
    let result = obj.get("result").ok_or(ParseError::MissingField("result"))?;

    match market {
        MarketKind::Spot => {
            let trade = result.as_object().ok_or(ParseError::NotObject)?;
            let pair = trade
                .get("currency_pair")
                .and_then(|v| v.as_str())
                .ok_or(ParseError::MissingField("currency_pair"))?;
            let price = parse_price_str(trade.get("price"))?;
            sink(pair, price);
            Ok(1)
        }
        MarketKind::Future => {
            let trades = result.as_array().ok_or(ParseError::NotObject)?;
            let mut delivered = 0;
            for entry in trades {
                let trade = entry.as_object().ok_or(ParseError::NotObject)?;
                let contract = trade
                    .get("contract")
                    .and_then(|v| v.as_str())
                    .ok_or(ParseError::MissingField("contract"))?;
                let price = parse_price_str(trade.get("price"))?;
                sink(contract, price);
                delivered += 1;
            }
            Ok(delivered)
        }
    }
}

#[inline]
fn parse_price_str(value: Option<&simd_json::BorrowedValue>) -> Result<f64, ParseError> {
    use simd_json::prelude::*;
    let s = value
        .and_then(|v| v.as_str())
        .ok_or(ParseError::MissingField("price"))?;
    fast_float::parse(s).map_err(|_| ParseError::InvalidNumber)
}
