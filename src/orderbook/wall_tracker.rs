//! Persistent large-resting-order ("wall") detection and lifecycle tracking.

use crate::orderbook::types::{
    OrderBook, Timeframe, Wall, WallEvent, WallMap, WallMapSide, WallSide,
};
use std::collections::HashMap;

/// Relative qty increase, above the tracked `current_qty`, that counts as a
/// replenish.
const REPLENISH_RATIO: f64 = 1.2;

/// Relative distance of the mid price to a wall that counts as a "test".
const TEST_DISTANCE: f64 = 0.003;

/// USD notional threshold used when a symbol has no configured override.
pub const DEFAULT_THRESHOLD_USD: f64 = 200_000.0;

/// Tracks wall lifecycle for a single symbol.
pub struct WallTracker {
    threshold: f64,
    walls: HashMap<(OrderedPrice, WallSide), Wall>,
    now_fn: fn() -> f64,
}

/// Wraps an `f64` price so it can be used as a HashMap key; prices observed
/// here always come from a finite, already-validated book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct OrderedPrice(u64);

impl From<f64> for OrderedPrice {
    fn from(price: f64) -> Self {
        OrderedPrice(price.to_bits())
    }
}

fn monotonic_now() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl WallTracker {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            walls: HashMap::new(),
            now_fn: monotonic_now,
        }
    }

    #[cfg(test)]
    fn with_clock(threshold: f64, now_fn: fn() -> f64) -> Self {
        Self {
            threshold,
            walls: HashMap::new(),
            now_fn,
        }
    }

    /// Processes one book snapshot, returning the ordered events emitted on
    /// this tick (bid events, then ask events, then cleanup events).
    pub fn update(&mut self, symbol: &str, orderbook: &OrderBook) -> Vec<WallEvent> {
        let now = (self.now_fn)();
        let mid = orderbook.mid_price();

        let mut events = Vec::new();
        self.process_side(symbol, WallSide::Bid, &orderbook.bids, mid, now, &mut events);
        self.process_side(symbol, WallSide::Ask, &orderbook.asks, mid, now, &mut events);
        self.cleanup(symbol, orderbook, &mut events);
        events
    }

    fn process_side(
        &mut self,
        symbol: &str,
        side: WallSide,
        levels: &[crate::orderbook::types::PriceLevel],
        mid: Option<f64>,
        now: f64,
        events: &mut Vec<WallEvent>,
    ) {
        for level in levels {
            let notional = level.notional();
            let key = (OrderedPrice::from(level.price), side);

            if notional >= self.threshold {
                if let Some(wall) = self.walls.get_mut(&key) {
                    if level.quantity > wall.current_qty * REPLENISH_RATIO {
                        wall.replenish_count += 1;
                        events.push(WallEvent::WallReplenish {
                            symbol: symbol.to_string(),
                            price: level.price,
                            side,
                            qty: level.quantity,
                            peak_qty: wall.peak_qty.max(level.quantity),
                        });
                    }

                    if let Some(mid) = mid {
                        if level.price > 0.0
                            && ((mid - level.price).abs() / level.price) < TEST_DISTANCE
                        {
                            wall.test_count += 1;
                            events.push(WallEvent::WallTest {
                                symbol: symbol.to_string(),
                                price: level.price,
                                side,
                                test_count: wall.test_count,
                            });
                        }
                    }

                    wall.current_qty = level.quantity;
                    wall.peak_qty = wall.peak_qty.max(level.quantity);
                    wall.last_seen = now;
                } else {
                    self.walls
                        .insert(key, Wall::new(level.price, side, level.quantity, now));
                    events.push(WallEvent::NewWall {
                        symbol: symbol.to_string(),
                        price: level.price,
                        side,
                        qty: level.quantity,
                    });
                }
            }
        }
    }

    fn cleanup(&mut self, symbol: &str, orderbook: &OrderBook, events: &mut Vec<WallEvent>) {
        let present: std::collections::HashSet<(OrderedPrice, WallSide)> = orderbook
            .bids
            .iter()
            .map(|l| (OrderedPrice::from(l.price), WallSide::Bid))
            .chain(
                orderbook
                    .asks
                    .iter()
                    .map(|l| (OrderedPrice::from(l.price), WallSide::Ask)),
            )
            .collect();

        let dead: Vec<(OrderedPrice, WallSide)> = self
            .walls
            .keys()
            .filter(|key| !present.contains(key))
            .copied()
            .collect();

        for key in dead {
            if let Some(wall) = self.walls.remove(&key) {
                let reason = if wall.test_count > 0 { "consumed" } else { "cancelled" };
                events.push(WallEvent::WallRemoved {
                    symbol: symbol.to_string(),
                    price: wall.price,
                    side: wall.side,
                    reason,
                });
            }
        }
    }

    /// Top-5 real walls per side at the given timeframe, plus total counts.
    pub fn get_wall_map(&self, timeframe: Timeframe) -> WallMap {
        let now = (self.now_fn)();
        let mut bids: Vec<Wall> = self
            .walls
            .values()
            .filter(|w| w.side == WallSide::Bid && w.is_real(timeframe, now))
            .cloned()
            .collect();
        let mut asks: Vec<Wall> = self
            .walls
            .values()
            .filter(|w| w.side == WallSide::Ask && w.is_real(timeframe, now))
            .cloned()
            .collect();

        bids.sort_by(|a, b| b.persistence_score(now).total_cmp(&a.persistence_score(now)));
        asks.sort_by(|a, b| b.persistence_score(now).total_cmp(&a.persistence_score(now)));

        let bid_total = bids.len();
        let ask_total = asks.len();
        bids.truncate(5);
        asks.truncate(5);

        WallMap {
            bids: WallMapSide {
                walls: bids,
                total_count: bid_total,
            },
            asks: WallMapSide {
                walls: asks,
                total_count: ask_total,
            },
        }
    }

    pub fn get_real_walls(&self, timeframe: Timeframe) -> Vec<Wall> {
        let now = (self.now_fn)();
        self.walls
            .values()
            .filter(|w| w.is_real(timeframe, now))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::types::PriceLevel;

    fn book_with_bid(price: f64, qty: f64) -> OrderBook {
        let mut book = OrderBook::empty("BTCUSDT");
        book.bids.push(PriceLevel { price, quantity: qty });
        book.asks.push(PriceLevel {
            price: price + 0.1,
            quantity: 1.0,
        });
        book
    }

    #[test]
    fn scenario_4_wall_birth_and_replenish() {
        let mut tracker = WallTracker::with_clock(200_000.0, || 0.0);

        let book1 = book_with_bid(100.0, 3000.0);
        let events1 = tracker.update("BTCUSDT", &book1);
        assert!(matches!(events1.as_slice(), [WallEvent::NewWall { .. }]));

        let book2 = book_with_bid(100.0, 4000.0);
        let events2 = tracker.update("BTCUSDT", &book2);
        assert!(events2
            .iter()
            .any(|e| matches!(e, WallEvent::WallReplenish { peak_qty, .. } if *peak_qty == 4000.0)));

        let mut book3 = OrderBook::empty("BTCUSDT");
        book3.asks.push(PriceLevel {
            price: 100.1,
            quantity: 1.0,
        });
        let events3 = tracker.update("BTCUSDT", &book3);
        assert!(events3
            .iter()
            .any(|e| matches!(e, WallEvent::WallRemoved { reason, .. } if *reason == "cancelled")));
    }

    #[test]
    fn persistence_score_monotonic_without_events() {
        let wall = Wall::new(100.0, WallSide::Bid, 3000.0, 0.0);
        let t1 = wall.persistence_score(60.0);
        let t2 = wall.persistence_score(120.0);
        assert!(t2 >= t1);
    }
}
