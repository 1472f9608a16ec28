//! Exchange identity and venue protocol dispatch
//!
//! Every supported venue exposes the same four surfaces to the rest of the
//! system: tick streams, depth-diff streams, REST depth snapshots, and the
//! symbol naming scheme that maps a base asset to the venue's pair format.
//! The concrete wire formats live in the per-venue submodules; everything
//! else in the crate talks to the dispatch methods on [`Exchange`].

pub mod binance;
pub mod gate;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::book::{DepthDiff, DepthSnapshot};

/// Supported venues. Catalog files reference these by lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Gate,
}

/// Spot market or USDT-margined perpetual future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Future,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Spot => "spot",
            MarketKind::Future => "future",
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Exchange {
    pub const ALL: [Exchange; 2] = [Exchange::Binance, Exchange::Gate];

    pub fn name(&self) -> &'static str {
        match self {
            Exchange::Binance => "Binance",
            Exchange::Gate => "Gate",
        }
    }

    /// Venue pair symbol for a base asset (quote is always USDT).
    pub fn venue_symbol(&self, base: &str) -> String {
        match self {
            Exchange::Binance => format!("{base}USDT"),
            Exchange::Gate => format!("{base}_USDT"),
        }
    }

    /// WebSocket URL for a single-symbol depth-diff subscription.
    ///
    /// Binance encodes the stream in the URL; Gate connects to a shared
    /// endpoint and subscribes via [`Exchange::depth_subscribe_payload`].
    pub fn depth_stream_url(&self, market: MarketKind, venue_symbol: &str) -> String {
        match self {
            Exchange::Binance => binance::depth_stream_url(market, venue_symbol),
            Exchange::Gate => gate::ws_url(market).to_string(),
        }
    }

    /// Subscribe message to send after connecting, if the venue needs one.
    pub fn depth_subscribe_payload(&self, market: MarketKind, venue_symbol: &str) -> Option<String> {
        match self {
            Exchange::Binance => None,
            Exchange::Gate => Some(gate::depth_subscribe_payload(market, venue_symbol)),
        }
    }

    /// Whether the venue acknowledges subscriptions with a first message
    /// that must be checked before updates are trusted.
    pub fn depth_requires_ack(&self) -> bool {
        matches!(self, Exchange::Gate)
    }

    /// REST endpoint for a depth snapshot at the given level count.
    pub fn depth_snapshot_url(&self, market: MarketKind, venue_symbol: &str, depth: u32) -> String {
        match self {
            Exchange::Binance => binance::depth_snapshot_url(market, venue_symbol, depth),
            Exchange::Gate => gate::depth_snapshot_url(market, venue_symbol, depth),
        }
    }

    /// Parse one WebSocket frame from a depth stream.
    pub fn parse_depth_message(
        &self,
        market: MarketKind,
        payload: &[u8],
    ) -> Result<DepthEvent, ParseError> {
        match self {
            Exchange::Binance => binance::parse_depth_message(payload),
            Exchange::Gate => gate::parse_depth_message(market, payload),
        }
    }

    /// Parse a REST depth snapshot response body.
    pub fn parse_depth_snapshot(
        &self,
        market: MarketKind,
        body: &[u8],
    ) -> Result<DepthSnapshot, ParseError> {
        match self {
            Exchange::Binance => binance::parse_depth_snapshot(body),
            Exchange::Gate => gate::parse_depth_snapshot(market, body),
        }
    }

    /// WebSocket URL for the venue-wide tick stream (all catalog symbols on
    /// one connection).
    pub fn tick_stream_url(&self, market: MarketKind, venue_symbols: &[String]) -> String {
        match self {
            Exchange::Binance => binance::tick_stream_url(market, venue_symbols),
            Exchange::Gate => gate::ws_url(market).to_string(),
        }
    }

    /// Subscribe message for the tick stream, if the venue needs one.
    pub fn tick_subscribe_payload(
        &self,
        market: MarketKind,
        venue_symbols: &[String],
    ) -> Option<String> {
        match self {
            Exchange::Binance => None,
            Exchange::Gate => Some(gate::tick_subscribe_payload(market, venue_symbols)),
        }
    }

    pub fn tick_requires_ack(&self) -> bool {
        matches!(self, Exchange::Gate)
    }

    /// Parse the first frame after subscribing, on venues where
    /// `*_requires_ack` is true.
    pub fn parse_subscribe_ack(&self, payload: &[u8]) -> Result<SubscribeAck, ParseError> {
        match self {
            Exchange::Binance => Err(ParseError::ControlMessage),
            Exchange::Gate => gate::parse_subscribe_ack(payload),
        }
    }

    /// Parse one tick-stream frame, delivering `(venue_symbol, price)` pairs
    /// to `sink`. The buffer is scratch space for in-place JSON parsing.
    ///
    /// Returns the number of trades delivered.
    pub fn parse_ticks(
        &self,
        market: MarketKind,
        payload: &mut [u8],
        sink: impl FnMut(&str, f64),
    ) -> Result<usize, ParseError> {
        match self {
            Exchange::Binance => binance::parse_ticks(payload, sink),
            Exchange::Gate => gate::parse_ticks(market, payload, sink),
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of one live stream: `exchange:market:symbol` where `symbol` is
/// the base asset (`BTC`), not the venue pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub exchange: Exchange,
    pub market: MarketKind,
    pub symbol: String,
}

impl StreamKey {
    pub fn new(exchange: Exchange, market: MarketKind, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            market,
            symbol: symbol.into(),
        }
    }

    pub fn venue_symbol(&self) -> String {
        self.exchange.venue_symbol(&self.symbol)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.market, self.symbol)
    }
}

/// Subscription acknowledgement. Gate sends one as the first frame after a
/// subscribe request, on both depth and tick channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub success: bool,
    pub detail: String,
}

/// A successfully parsed depth-stream frame.
#[derive(Debug)]
pub enum DepthEvent {
    Diff(DepthDiff),
    Ack(SubscribeAck),
}

/// Why a frame could not be turned into a [`DepthEvent`] or tick. Callers
/// drop these silently per the stream fault policy; they exist so tests and
/// metrics can distinguish junk from control traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidJson,
    NotObject,
    MissingField(&'static str),
    InvalidNumber,
    /// Valid JSON that is not market data (pings, subscribe responses).
    ControlMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_symbol_mapping() {
        assert_eq!(Exchange::Binance.venue_symbol("BTC"), "BTCUSDT");
        assert_eq!(Exchange::Gate.venue_symbol("BTC"), "BTC_USDT");
    }

    #[test]
    fn test_stream_key_display() {
        let key = StreamKey::new(Exchange::Gate, MarketKind::Future, "ETH");
        assert_eq!(key.to_string(), "Gate:future:ETH");
        assert_eq!(key.venue_symbol(), "ETH_USDT");
    }

    #[test]
    fn test_exchange_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Exchange::Binance).unwrap();
        assert_eq!(json, "\"binance\"");
        let back: Exchange = serde_json::from_str("\"gate\"").unwrap();
        assert_eq!(back, Exchange::Gate);
    }
}
