//! Per-symbol L2 state machine: reconciles a REST snapshot with a stream of
//! incremental depth events and detects desynchronization.

use crate::error::{EngineError, Result};
use crate::orderbook::types::{DepthEvent, DepthSnapshot, OrderBook, PriceLevel};
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Depth levels requested from the REST snapshot and kept in the live book.
pub const DEFAULT_DEPTH: usize = 20;

/// Venue REST base URL, overridable via `ORDERBOOK_BINANCE_REST_URL`.
pub const DEFAULT_REST_URL: &str = "https://fapi.binance.com";

/// Fetches a depth-D snapshot from the venue REST endpoint. Standalone so it
/// can be driven from a detached resync task without borrowing a `BookState`.
pub async fn fetch_snapshot(
    http: &Client,
    rest_url: &str,
    symbol: &str,
    depth: usize,
) -> Result<DepthSnapshot> {
    let url = format!("{rest_url}/fapi/v1/depth");
    let snapshot: DepthSnapshot = http
        .get(&url)
        .query(&[("symbol", symbol), ("limit", &depth.to_string())])
        .send()
        .await
        .map_err(EngineError::from)?
        .json()
        .await
        .map_err(EngineError::from)?;
    Ok(snapshot)
}

fn parse_levels(raw: &[(String, String)]) -> Result<Vec<PriceLevel>> {
    raw.iter()
        .map(|(p, q)| {
            let price = f64::from_str(p)
                .map_err(|e| EngineError::MalformedMessage(format!("invalid price: {e}")))?;
            let quantity = f64::from_str(q)
                .map_err(|e| EngineError::MalformedMessage(format!("invalid quantity: {e}")))?;
            Ok(PriceLevel { price, quantity })
        })
        .collect()
}

/// The synchronized per-symbol book plus the reconciliation bookkeeping
/// needed to validate incoming diffs.
pub struct BookState {
    symbol: String,
    depth: usize,
    rest_url: String,
    http: Client,
    book: OrderBook,
    /// Last applied event's final update id; advances on every success.
    last_u: i64,
    /// The REST snapshot's `lastUpdateId`, fixed until the next (re)init.
    snapshot_last_update_id: i64,
    initialized: bool,
}

impl BookState {
    pub fn new(symbol: impl Into<String>, depth: usize, rest_url: impl Into<String>) -> Self {
        let symbol = symbol.into();
        Self {
            book: OrderBook::empty(symbol.clone()),
            symbol,
            depth,
            rest_url: rest_url.into(),
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("orderbook-engine/0.1.0")
                .build()
                .expect("failed to build REST client"),
            last_u: 0,
            snapshot_last_update_id: 0,
            initialized: false,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn http_client(&self) -> Client {
        self.http.clone()
    }

    pub fn rest_url(&self) -> &str {
        &self.rest_url
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Fetches a depth-D snapshot from the venue REST endpoint and seeds the
    /// book. Safe to call again (e.g. on desync) — state is overwritten
    /// wholesale, not merged.
    pub async fn initialize(&mut self) -> Result<()> {
        let snapshot = fetch_snapshot(&self.http, &self.rest_url, &self.symbol, self.depth).await?;
        self.apply_snapshot(snapshot);
        Ok(())
    }

    /// Seeds the book from an already-fetched REST snapshot. Used both by
    /// `initialize` and by the Collector's out-of-band async resync path,
    /// which fetches on a detached task and hands the result back to the
    /// single message-handling task.
    pub fn apply_snapshot(&mut self, snapshot: DepthSnapshot) {
        let mut bids = parse_levels(&snapshot.bids).unwrap_or_default();
        let mut asks = parse_levels(&snapshot.asks).unwrap_or_default();
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        bids.truncate(self.depth);
        asks.truncate(self.depth);

        self.book.bids = bids;
        self.book.asks = asks;
        self.book.last_update_id = snapshot.last_update_id;
        self.book.timestamp = Utc::now();
        self.last_u = snapshot.last_update_id;
        self.snapshot_last_update_id = snapshot.last_update_id;
        self.initialized = true;

        debug!(
            symbol = %self.symbol,
            last_update_id = snapshot.last_update_id,
            bids = self.book.bids.len(),
            asks = self.book.asks.len(),
            "book initialized from REST snapshot"
        );
    }

    /// Applies one incremental depth event. Returns `true` on success; on
    /// `false` the book is left completely unchanged.
    pub fn process_update(&mut self, event: &DepthEvent) -> bool {
        if !self.initialized {
            return false;
        }

        let u = event.final_update_id;
        let first_update_id = event.first_update_id.unwrap_or(u);
        let prev_final_update_id = event.prev_final_update_id.unwrap_or(self.last_u);

        if self.last_u == self.snapshot_last_update_id {
            if !(first_update_id <= self.last_u + 1 && self.last_u + 1 <= u) {
                return false;
            }
        } else if prev_final_update_id != self.last_u {
            return false;
        }

        let mut bids = match apply_side(&self.book.bids, &event.bids) {
            Ok(levels) => levels,
            Err(_) => return false,
        };
        let mut asks = match apply_side(&self.book.asks, &event.asks) {
            Ok(levels) => levels,
            Err(_) => return false,
        };

        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        bids.truncate(self.depth);
        asks.truncate(self.depth);

        if let (Some(best_bid), Some(best_ask)) = (bids.first(), asks.first()) {
            if best_bid.price >= best_ask.price {
                warn!(symbol = %self.symbol, "crossed book after apply, treating as desync");
                return false;
            }
        }

        self.book.bids = bids;
        self.book.asks = asks;
        self.book.last_update_id = u;
        self.book.timestamp = Utc::now();
        self.last_u = u;
        true
    }

    /// A deep, immutable copy of the current book for downstream consumers.
    pub fn snapshot(&self) -> OrderBook {
        self.book.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Applies (price, qty) diffs to one side of the book: a zero quantity
/// removes the entry, a positive quantity replaces it.
fn apply_side(current: &[PriceLevel], updates: &[(String, String)]) -> Result<Vec<PriceLevel>> {
    let mut by_price: HashMap<u64, PriceLevel> = current
        .iter()
        .map(|level| (level.price.to_bits(), *level))
        .collect();

    for (price_str, qty_str) in updates {
        let price = f64::from_str(price_str)
            .map_err(|e| EngineError::MalformedMessage(format!("invalid price: {e}")))?;
        let quantity = f64::from_str(qty_str)
            .map_err(|e| EngineError::MalformedMessage(format!("invalid quantity: {e}")))?;

        if quantity == 0.0 {
            by_price.remove(&price.to_bits());
        } else {
            by_price.insert(price.to_bits(), PriceLevel { price, quantity });
        }
    }

    Ok(by_price.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_book() -> BookState {
        let mut state = BookState::new("BTCUSDT", 20, DEFAULT_REST_URL);
        state.book.bids = vec![
            PriceLevel {
                price: 10.0,
                quantity: 1.0,
            },
            PriceLevel {
                price: 9.9,
                quantity: 2.0,
            },
        ];
        state.book.asks = vec![PriceLevel {
            price: 10.1,
            quantity: 1.5,
        }];
        state.book.last_update_id = 100;
        state.last_u = 100;
        state.snapshot_last_update_id = 100;
        state.initialized = true;
        state
    }

    fn event(u: i64, first: Option<i64>, pu: Option<i64>, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> DepthEvent {
        DepthEvent {
            first_update_id: first,
            final_update_id: u,
            prev_final_update_id: pu,
            bids: bids.iter().map(|(p, q)| (p.to_string(), q.to_string())).collect(),
            asks: asks.iter().map(|(p, q)| (p.to_string(), q.to_string())).collect(),
        }
    }

    #[test]
    fn scenario_1_initialization_happy_path() {
        let mut state = fresh_book();
        let evt = event(103, Some(101), None, &[("9.9", "0")], &[("10.2", "0.5")]);
        assert!(state.process_update(&evt));

        let snap = state.snapshot();
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.bids[0].price, 10.0);
        assert_eq!(snap.asks.len(), 2);
        assert_eq!(snap.asks[0].price, 10.1);
        assert_eq!(snap.asks[1].price, 10.2);
        assert_eq!(snap.last_update_id, 103);
    }

    #[test]
    fn scenario_2_gap_rejection() {
        let mut state = fresh_book();
        let evt = event(107, Some(105), None, &[], &[]);
        assert!(!state.process_update(&evt));
        assert_eq!(state.snapshot().last_update_id, 100);
    }

    #[test]
    fn scenario_3_desync_via_previous_id() {
        let mut state = fresh_book();
        let first = event(103, Some(101), None, &[("9.9", "0")], &[("10.2", "0.5")]);
        assert!(state.process_update(&first));

        let bad = event(106, Some(104), Some(104), &[], &[]);
        assert!(!state.process_update(&bad));
        assert_eq!(state.snapshot().last_update_id, 103);
    }

    #[test]
    fn rejects_until_initialized() {
        let mut state = BookState::new("ETHUSDT", 20, DEFAULT_REST_URL);
        let evt = event(1, Some(1), None, &[], &[]);
        assert!(!state.process_update(&evt));
    }

    #[test]
    fn crossed_book_after_apply_is_rejected() {
        let mut state = fresh_book();
        // Ask update moves best ask below best bid -> crossed, must reject and
        // leave the book untouched.
        let evt = event(
            101,
            Some(101),
            None,
            &[],
            &[("9.95", "1.0")],
        );
        assert!(!state.process_update(&evt));
        assert_eq!(state.snapshot().last_update_id, 100);
    }
}
