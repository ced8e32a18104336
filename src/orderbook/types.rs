//! Shared data model for the order-book engine: price levels, the L2 book,
//! walls, OFI state, and the per-tick record handed to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single resting-order level: strictly positive price, non-negative
/// quantity. A quantity of zero denotes deletion and is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

impl PriceLevel {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Which side of the book a wall sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WallSide {
    Bid,
    Ask,
}

impl std::fmt::Display for WallSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WallSide::Bid => write!(f, "BID"),
            WallSide::Ask => write!(f, "ASK"),
        }
    }
}

/// The wall-map / `is_real` timeframe buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    FourHour,
    OneHour,
    FifteenMin,
}

impl Timeframe {
    pub fn params(self) -> TimeframeParams {
        match self {
            Timeframe::FourHour => TimeframeParams {
                min_age_minutes: 120.0,
                min_persistence: 150.0,
                influence_zone: 0.005,
            },
            Timeframe::OneHour => TimeframeParams {
                min_age_minutes: 30.0,
                min_persistence: 40.0,
                influence_zone: 0.003,
            },
            Timeframe::FifteenMin => TimeframeParams {
                min_age_minutes: 10.0,
                min_persistence: 15.0,
                influence_zone: 0.0015,
            },
        }
    }

    /// Parses the wire token, defaulting unknown values to 1h per spec.
    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "4h" => Timeframe::FourHour,
            "15min" => Timeframe::FifteenMin,
            "1h" => Timeframe::OneHour,
            _ => Timeframe::OneHour,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::FourHour => "4h",
            Timeframe::OneHour => "1h",
            Timeframe::FifteenMin => "15min",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeframeParams {
    pub min_age_minutes: f64,
    pub min_persistence: f64,
    pub influence_zone: f64,
}

/// A tracked persistent large resting order, keyed by (price, side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wall {
    pub price: f64,
    pub side: WallSide,
    pub initial_qty: f64,
    pub current_qty: f64,
    pub peak_qty: f64,
    pub first_seen: f64,
    pub last_seen: f64,
    pub replenish_count: u32,
    pub test_count: u32,
}

impl Wall {
    pub fn new(price: f64, side: WallSide, qty: f64, now: f64) -> Self {
        Self {
            price,
            side,
            initial_qty: qty,
            current_qty: qty,
            peak_qty: qty,
            first_seen: now,
            last_seen: now,
            replenish_count: 0,
            test_count: 0,
        }
    }

    pub fn age_minutes(&self, now: f64) -> f64 {
        (now - self.first_seen) / 60.0
    }

    pub fn notional(&self) -> f64 {
        self.price * self.current_qty
    }

    pub fn health(&self) -> f64 {
        if self.peak_qty <= 0.0 {
            0.0
        } else {
            (self.current_qty / self.peak_qty).min(1.0)
        }
    }

    pub fn persistence_score(&self, now: f64) -> f64 {
        let age = self.age_minutes(now);
        if self.test_count == 0 {
            age * 0.5
        } else {
            age * (1.0 + self.replenish_count as f64 / self.test_count.max(1) as f64)
        }
    }

    /// Whether this wall qualifies as "real" at the given timeframe.
    pub fn is_real(&self, timeframe: Timeframe, now: f64) -> bool {
        let params = timeframe.params();
        self.age_minutes(now) >= params.min_age_minutes
            && self.persistence_score(now) >= params.min_persistence
    }
}

/// Tagged wall lifecycle events, serialized to the literal wire strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WallEvent {
    #[serde(rename = "NEW_WALL")]
    NewWall {
        symbol: String,
        price: f64,
        side: WallSide,
        qty: f64,
    },
    #[serde(rename = "WALL_REPLENISH")]
    WallReplenish {
        symbol: String,
        price: f64,
        side: WallSide,
        qty: f64,
        peak_qty: f64,
    },
    #[serde(rename = "WALL_TEST")]
    WallTest {
        symbol: String,
        price: f64,
        side: WallSide,
        test_count: u32,
    },
    #[serde(rename = "WALL_REMOVED")]
    WallRemoved {
        symbol: String,
        price: f64,
        side: WallSide,
        reason: &'static str,
    },
}

/// Per-side, per-timeframe view returned by `WallTracker::get_wall_map`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WallMapSide {
    pub walls: Vec<Wall>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WallMap {
    pub bids: WallMapSide,
    pub asks: WallMapSide,
}

/// The categorical OFI signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfiSignal {
    #[serde(rename = "STRONG_BUY")]
    StrongBuy,
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "NEUTRAL")]
    Neutral,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "STRONG_SELL")]
    StrongSell,
}

impl OfiSignal {
    pub fn from_z_score(z: f64) -> Self {
        if z > 2.0 {
            OfiSignal::StrongBuy
        } else if z > 1.0 {
            OfiSignal::Buy
        } else if z < -2.0 {
            OfiSignal::StrongSell
        } else if z < -1.0 {
            OfiSignal::Sell
        } else {
            OfiSignal::Neutral
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OfiSignal::StrongBuy => "STRONG_BUY",
            OfiSignal::Buy => "BUY",
            OfiSignal::Neutral => "NEUTRAL",
            OfiSignal::Sell => "SELL",
            OfiSignal::StrongSell => "STRONG_SELL",
        }
    }
}

/// Output of `OfiEngine::update` on every tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OfiState {
    pub raw: f64,
    pub ema: f64,
    pub std: f64,
    pub z_score: f64,
    pub signal: OfiSignal,
}

impl Default for OfiState {
    fn default() -> Self {
        Self {
            raw: 0.0,
            ema: 0.0,
            std: 0.0,
            z_score: 0.0,
            signal: OfiSignal::Neutral,
        }
    }
}

/// A synchronized, depth-truncated L2 view for a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_update_id: i64,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn empty(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            last_update_id: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(b), Some(a), Some(mid)) if mid > 0.0 => Some((a - b) / mid * 10_000.0),
            _ => None,
        }
    }
}

/// A compact book summary embedded in `UpdateRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSummary {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub mid: Option<f64>,
    pub spread_bps: Option<f64>,
}

impl From<&OrderBook> for BookSummary {
    fn from(book: &OrderBook) -> Self {
        Self {
            best_bid: book.best_bid(),
            best_ask: book.best_ask(),
            mid: book.mid_price(),
            spread_bps: book.spread_bps(),
        }
    }
}

/// The assembled per-tick record dispatched to every subscriber and written
/// to the latest-snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub book: BookSummary,
    pub ofi: OfiState,
    pub wall_events: Vec<WallEvent>,
    pub wall_map_4h: WallMap,
    pub wall_map_1h: WallMap,
    pub wall_map_15min: WallMap,
}

/// The inbound incremental depth event, decoded from the combined stream.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthEvent {
    #[serde(rename = "U")]
    pub first_update_id: Option<i64>,
    #[serde(rename = "u")]
    pub final_update_id: i64,
    #[serde(rename = "pu")]
    pub prev_final_update_id: Option<i64>,
    #[serde(rename = "b")]
    pub bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    pub asks: Vec<(String, String)>,
}

/// Envelope wrapping every combined-stream message.
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedStreamEnvelope {
    pub stream: String,
    pub data: DepthEvent,
}

/// Decoded REST `GET /fapi/v1/depth` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshot {
    pub last_update_id: i64,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
}

/// Latest-snapshot file contents: `{ timestamp, data: { SYMBOL: record } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestSnapshot {
    pub timestamp: DateTime<Utc>,
    pub data: HashMap<String, UpdateRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notional_is_price_times_quantity() {
        let level = PriceLevel {
            price: 100.0,
            quantity: 3000.0,
        };
        assert_eq!(level.notional(), 300_000.0);
    }

    #[test]
    fn book_derived_fields() {
        let mut book = OrderBook::empty("BTCUSDT");
        book.bids.push(PriceLevel {
            price: 10.0,
            quantity: 1.0,
        });
        book.asks.push(PriceLevel {
            price: 10.1,
            quantity: 1.5,
        });
        assert_eq!(book.best_bid(), Some(10.0));
        assert_eq!(book.best_ask(), Some(10.1));
        assert_eq!(book.mid_price(), Some(10.05));
        let spread = book.spread_bps().unwrap();
        assert!((spread - (0.1 / 10.05 * 10_000.0)).abs() < 1e-9);
    }

    #[test]
    fn wall_persistence_score_without_tests() {
        let wall = Wall::new(100.0, WallSide::Bid, 3000.0, 0.0);
        // 120 seconds later -> 2 minutes age, no tests -> 2 * 0.5 = 1.0
        assert!((wall.persistence_score(120.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn wall_persistence_score_with_tests_and_replenish() {
        let mut wall = Wall::new(100.0, WallSide::Bid, 3000.0, 0.0);
        wall.test_count = 2;
        wall.replenish_count = 1;
        // 600 seconds -> 10 minutes age; 10 * (1 + 1/2) = 15
        assert!((wall.persistence_score(600.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn timeframe_defaults_unknown_to_one_hour() {
        assert!(matches!(
            Timeframe::parse_or_default("bogus"),
            Timeframe::OneHour
        ));
    }

    #[test]
    fn ofi_signal_thresholds() {
        assert_eq!(OfiSignal::from_z_score(2.5), OfiSignal::StrongBuy);
        assert_eq!(OfiSignal::from_z_score(1.5), OfiSignal::Buy);
        assert_eq!(OfiSignal::from_z_score(0.0), OfiSignal::Neutral);
        assert_eq!(OfiSignal::from_z_score(-1.5), OfiSignal::Sell);
        assert_eq!(OfiSignal::from_z_score(-2.5), OfiSignal::StrongSell);
    }
}
