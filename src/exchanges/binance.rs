//! Binance wire formats: spot + USDT-M futures.
//!
//! Depth diffs arrive on per-symbol `/ws/<sym>@depth@100ms` streams as bare
//! `depthUpdate` objects; ticks arrive on one combined `/stream` connection
//! wrapped in a `{"stream","data"}` envelope. REST snapshots come from the
//! `depth` endpoint of the matching API family. All prices and quantities
//! are decimal strings on the wire.

use serde::Deserialize;

use crate::book::{DepthDiff, DepthSnapshot, PriceLevel};
use crate::exchanges::{DepthEvent, MarketKind, ParseError};

const SPOT_WS_BASE: &str = "wss://stream.binance.com:9443";
const FUTURES_WS_BASE: &str = "wss://fstream.binance.com";
const SPOT_REST_BASE: &str = "https://api.binance.com";
const FUTURES_REST_BASE: &str = "https://fapi.binance.com";

// =============================================================================
// URL BUILDERS
// =============================================================================

pub fn depth_stream_url(market: MarketKind, venue_symbol: &str) -> String {
    let base = match market {
        MarketKind::Spot => SPOT_WS_BASE,
        MarketKind::Future => FUTURES_WS_BASE,
    };
    format!("{}/ws/{}@depth@100ms", base, venue_symbol.to_lowercase())
}

pub fn depth_snapshot_url(market: MarketKind, venue_symbol: &str, depth: u32) -> String {
    match market {
        MarketKind::Spot => format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            SPOT_REST_BASE, venue_symbol, depth
        ),
        MarketKind::Future => format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            FUTURES_REST_BASE, venue_symbol, depth
        ),
    }
}

/// Combined stream carrying every symbol's trades on one connection. Spot
/// uses raw trades; futures only exposes aggregated trades.
pub fn tick_stream_url(market: MarketKind, venue_symbols: &[String]) -> String {
    let (base, suffix) = match market {
        MarketKind::Spot => (SPOT_WS_BASE, "trade"),
        MarketKind::Future => (FUTURES_WS_BASE, "aggTrade"),
    };
    let streams = venue_symbols
        .iter()
        .map(|s| format!("{}@{}", s.to_lowercase(), suffix))
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/stream?streams={}", base, streams)
}

// =============================================================================
// DEPTH PARSING
// =============================================================================

/// Parse one depth-stream frame.
/// Format: {"e":"depthUpdate","E":...,"s":"BTCUSDT","U":157,"u":160,
///          "b":[["0.0024","10"]],"a":[["0.0026","100"]]}
/// Futures frames add "pu"; sequencing uses U/u on both markets.
pub fn parse_depth_message(payload: &[u8]) -> Result<DepthEvent, ParseError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|_| ParseError::InvalidJson)?;
    let obj = value.as_object().ok_or(ParseError::NotObject)?;

    // Subscription responses on a reused connection
    if obj.contains_key("result") || obj.contains_key("id") {
        return Err(ParseError::ControlMessage);
    }
    if obj.get("e").and_then(|v| v.as_str()) != Some("depthUpdate") {
        return Err(ParseError::ControlMessage);
    }

    let first_id = obj
        .get("U")
        .and_then(|v| v.as_u64())
        .ok_or(ParseError::MissingField("U"))?;
    let last_id = obj
        .get("u")
        .and_then(|v| v.as_u64())
        .ok_or(ParseError::MissingField("u"))?;

    Ok(DepthEvent::Diff(DepthDiff {
        first_id,
        last_id,
        bids: parse_level_array(obj, "b")?,
        asks: parse_level_array(obj, "a")?,
    }))
}

fn parse_level_array(
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

/// REST depth response, identical on spot and futures apart from extra
/// timestamp fields we ignore.
#[derive(Debug, Deserialize)]
struct RestDepth {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

pub fn parse_depth_snapshot(body: &[u8]) -> Result<DepthSnapshot, ParseError> {
    let snap: RestDepth = serde_json::from_slice(body).map_err(|_| ParseError::InvalidJson)?;
    Ok(DepthSnapshot {
        last_id: snap.last_update_id,
        bids: convert_rest_levels(&snap.bids)?,
        asks: convert_rest_levels(&snap.asks)?,
    })
}

fn convert_rest_levels(entries: &[[String; 2]]) -> Result<Vec<PriceLevel>, ParseError> {
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

// =============================================================================
// TICK PARSING (SIMD-JSON)
// =============================================================================

/// Parse one combined-stream trade frame.
/// Format: {"stream":"btcusdt@trade","data":{"s":"BTCUSDT","p":"0.001",...}}
/// The trade and aggTrade payloads share the "s"/"p" fields we need.
#[inline]
pub fn parse_ticks(
    payload: &mut [u8],
    mut sink: impl FnMut(&str, f64),
) -> Result<usize, ParseError> {
    use simd_json::prelude::*;

    let value = simd_json::to_borrowed_value(payload).map_err(|_| ParseError::InvalidJson)?;
    let obj = value.as_object().ok_or(ParseError::NotObject)?;

    // Ping/pong or subscription responses
    if obj.contains_key("result") || obj.contains_key("id") {
        return Err(ParseError::ControlMessage);
    }

    let data = obj
        .get("data")
        .and_then(|v| v.as_object())
        .ok_or(ParseError::MissingField("data"))?;
    let symbol = data
        .get("s")
        .and_then(|v| v.as_str())
        .ok_or(ParseError::MissingField("s"))?;
    let price_str = data
        .get("p")
        .and_then(|v| v.as_str())
        .ok_or(ParseError::MissingField("p"))?;
    let price: f64 = fast_float::parse(price_str).map_err(|_| ParseError::InvalidNumber)?;

    sink(symbol, price);
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_stream_urls() {
        assert_eq!(
            depth_stream_url(MarketKind::Spot, "BTCUSDT"),
            "wss://stream.binance.com:9443/ws/btcusdt@depth@100ms"
        );
        assert_eq!(
            depth_stream_url(MarketKind::Future, "ETHUSDT"),
            "wss://fstream.binance.com/ws/ethusdt@depth@100ms"
        );
    }

    #[test]
    fn test_depth_snapshot_urls() {
        assert_eq!(
            depth_snapshot_url(MarketKind::Spot, "BTCUSDT", 100),
            "https://api.binance.com/api/v3/depth?symbol=BTCUSDT&limit=100"
        );
        assert_eq!(
            depth_snapshot_url(MarketKind::Future, "BTCUSDT", 500),
            "https://fapi.binance.com/fapi/v1/depth?symbol=BTCUSDT&limit=500"
        );
    }

    #[test]
    fn test_tick_stream_url_joins_symbols() {
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        assert_eq!(
            tick_stream_url(MarketKind::Spot, &symbols),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@trade/ethusdt@trade"
        );
        assert_eq!(
            tick_stream_url(MarketKind::Future, &symbols),
            "wss://fstream.binance.com/stream?streams=btcusdt@aggTrade/ethusdt@aggTrade"
        );
    }

    #[test]
    fn test_parse_depth_update() {
        let msg = br#"{"e":"depthUpdate","E":1672515782136,"s":"BTCUSDT","U":157,"u":160,"b":[["0.0024","10"]],"a":[["0.0026","100"]]}"#;
        let event = parse_depth_message(msg).unwrap();
        let DepthEvent::Diff(diff) = event else {
            panic!("expected diff");
        };

        assert_eq!(diff.first_id, 157);
        assert_eq!(diff.last_id, 160);
        assert_eq!(diff.bids, vec![PriceLevel::new(0.0024, 10.0)]);
        assert_eq!(diff.asks, vec![PriceLevel::new(0.0026, 100.0)]);
    }

    #[test]
    fn test_parse_futures_depth_update_ignores_pu() {
        let msg = br#"{"e":"depthUpdate","E":1571889248277,"T":1571889248276,"s":"BTCUSDT","U":390497796,"u":390497878,"pu":390497794,"b":[["7403.89","0.002"]],"a":[["7405.96","3.340"]]}"#;
        let DepthEvent::Diff(diff) = parse_depth_message(msg).unwrap() else {
            panic!("expected diff");
        };
        assert_eq!(diff.first_id, 390497796);
        assert_eq!(diff.last_id, 390497878);
    }

    #[test]
    fn test_parse_depth_rejects_control_and_junk() {
        assert_eq!(
            parse_depth_message(br#"{"result":null,"id":312}"#).unwrap_err(),
            ParseError::ControlMessage
        );
        assert_eq!(
            parse_depth_message(br#"{"e":"trade","s":"BTCUSDT"}"#).unwrap_err(),
            ParseError::ControlMessage
        );
        assert_eq!(
            parse_depth_message(b"not json").unwrap_err(),
            ParseError::InvalidJson
        );
        assert_eq!(
            parse_depth_message(br#"[1,2,3]"#).unwrap_err(),
            ParseError::NotObject
        );
        assert_eq!(
            parse_depth_message(br#"{"e":"depthUpdate","u":160,"b":[],"a":[]}"#).unwrap_err(),
            ParseError::MissingField("U")
        );
        assert_eq!(
            parse_depth_message(
                br#"{"e":"depthUpdate","U":1,"u":2,"b":[["abc","10"]],"a":[]}"#
            )
            .unwrap_err(),
            ParseError::InvalidNumber
        );
    }

    #[test]
    fn test_parse_depth_snapshot() {
        let body = br#"{"lastUpdateId":1027024,"bids":[["4.00000000","431.00000000"],["3.99000000","9.00000000"]],"asks":[["4.00000200","12.00000000"]]}"#;
        let snap = parse_depth_snapshot(body).unwrap();

        assert_eq!(snap.last_id, 1027024);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.bids[0], PriceLevel::new(4.0, 431.0));
        assert_eq!(snap.asks, vec![PriceLevel::new(4.000002, 12.0)]);
    }

    #[test]
    fn test_parse_spot_trade_tick() {
        let msg = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1672515782136,"s":"BTCUSDT","t":12345,"p":"64123.50","q":"0.5","T":1672515782136,"m":true,"M":true}}"#;
        let mut buf = msg.as_bytes().to_vec();

        let mut ticks = Vec::new();
        let n = parse_ticks(&mut buf, |s, p| ticks.push((s.to_string(), p))).unwrap();

        assert_eq!(n, 1);
        assert_eq!(ticks, vec![("BTCUSDT".to_string(), 64123.5)]);
    }

    #[test]
    fn test_parse_futures_agg_trade_tick() {
        let msg = r#"{"stream":"ethusdt@aggTrade","data":{"e":"aggTrade","E":1123456789,"s":"ETHUSDT","a":5933014,"p":"3120.25","q":"100","f":100,"l":105,"T":1123456785,"m":true}}"#;
        let mut buf = msg.as_bytes().to_vec();

        let mut ticks = Vec::new();
        parse_ticks(&mut buf, |s, p| ticks.push((s.to_string(), p))).unwrap();
        assert_eq!(ticks, vec![("ETHUSDT".to_string(), 3120.25)]);
    }

    #[test]
    fn test_parse_ticks_rejects_control() {
        let mut buf = br#"{"result":null,"id":1}"#.to_vec();
        assert_eq!(
            parse_ticks(&mut buf, |_, _| {}).unwrap_err(),
            ParseError::ControlMessage
        );
    }
}
