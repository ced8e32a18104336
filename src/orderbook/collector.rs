//! Feed client: drives BookState/WallTracker/OfiEngine per symbol from the
//! combined-stream depth feed and fans assembled records out to subscribers.

use crate::error::{EngineError, Result};
use crate::orderbook::book_state::{fetch_snapshot, BookState, DEFAULT_DEPTH};
use crate::orderbook::ofi_engine::OfiEngine;
use crate::orderbook::types::{
    BookSummary, CombinedStreamEnvelope, Timeframe, UpdateRecord,
};
use crate::orderbook::wall_tracker::{WallTracker, DEFAULT_THRESHOLD_USD};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Reconnect delay after a websocket error or remote close.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Retry delay between failed startup/resync REST initializations.
const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default venue websocket base, overridable via `ORDERBOOK_BINANCE_WS_URL`.
pub const DEFAULT_WS_URL: &str = "wss://fstream.binance.com";

/// A registered consumer of assembled `UpdateRecord`s. Implementations that
/// have no async work to do can finish synchronously and return an
/// already-ready future.
pub trait Subscriber: Send + Sync {
    fn on_update<'a>(
        &'a self,
        record: &'a UpdateRecord,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

struct SymbolEngines {
    book: BookState,
    walls: WallTracker,
    ofi: OfiEngine,
}

/// Result of a detached resync/init task, fed back to the message loop.
struct ReinitResult {
    symbol: String,
    snapshot: Result<crate::orderbook::types::DepthSnapshot>,
}

pub struct CollectorConfig {
    pub symbols: Vec<String>,
    pub thresholds: HashMap<String, f64>,
    pub rest_url: String,
    pub ws_url: String,
    pub depth: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            thresholds: HashMap::new(),
            rest_url: crate::orderbook::book_state::DEFAULT_REST_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            depth: DEFAULT_DEPTH,
        }
    }
}

pub struct Collector {
    config: CollectorConfig,
    engines: HashMap<String, SymbolEngines>,
    subscribers: Vec<Arc<dyn Subscriber>>,
    running: Arc<AtomicBool>,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        let mut engines = HashMap::new();
        for symbol in &config.symbols {
            let threshold = config
                .thresholds
                .get(symbol)
                .copied()
                .unwrap_or(DEFAULT_THRESHOLD_USD);
            engines.insert(
                symbol.clone(),
                SymbolEngines {
                    book: BookState::new(symbol.clone(), config.depth, config.rest_url.clone()),
                    walls: WallTracker::new(threshold),
                    ofi: OfiEngine::with_defaults(),
                },
            );
        }

        Self {
            config,
            engines,
            subscribers: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Flips the running flag so the read loop exits at its next iteration.
    /// Idempotent and safe to call from a signal handler.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// A cloned handle to the running flag, for signal handlers that outlive
    /// a borrow of the `Collector` itself (e.g. a spawned ctrl_c task).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Initializes all BookStates in parallel against the REST snapshot
    /// endpoint, then connects to the combined depth stream and runs until
    /// `stop()` is called.
    pub async fn run(&mut self) -> Result<()> {
        self.initialize_all().await?;
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.connect_and_process().await {
                warn!(error = %e, "combined stream connection dropped, reconnecting in 5s");
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            sleep(RECONNECT_DELAY).await;
        }

        info!("collector stopped");
        Ok(())
    }

    async fn initialize_all(&mut self) -> Result<()> {
        let results = futures_util::future::join_all(self.engines.iter_mut().map(
            |(symbol, engines)| async move {
                loop {
                    match engines.book.initialize().await {
                        Ok(()) => return Ok(symbol.clone()),
                        Err(e) if e.is_retryable() => {
                            warn!(symbol = %symbol, error = %e, "startup init failed, retrying");
                            sleep(INIT_RETRY_DELAY).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            },
        ))
        .await;

        for result in results {
            result.map_err(|e| EngineError::FatalInit(e.to_string()))?;
        }
        Ok(())
    }

    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .config
            .symbols
            .iter()
            .map(|s| format!("{}@depth20@500ms", s.to_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.config.ws_url, streams.join("/"))
    }

    async fn connect_and_process(&mut self) -> Result<()> {
        let url = self.stream_url();
        info!(url = %url, "connecting to combined depth stream");
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (reinit_tx, mut reinit_rx) = mpsc::unbounded_channel::<ReinitResult>();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(&text, &reinit_tx).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                return Err(EngineError::TransientNetwork("failed to send pong".into()));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(EngineError::TransientNetwork("stream closed".into()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                Some(result) = reinit_rx.recv() => {
                    self.apply_reinit_result(result);
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        text: &str,
        reinit_tx: &mpsc::UnboundedSender<ReinitResult>,
    ) {
        let envelope: CombinedStreamEnvelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "dropping malformed message");
                return;
            }
        };

        let symbol = match envelope.stream.split('@').next() {
            Some(token) => token.to_uppercase(),
            None => return,
        };

        let Some(engines) = self.engines.get_mut(&symbol) else {
            debug!(symbol = %symbol, "update for unknown symbol, dropping");
            return;
        };

        if !engines.book.process_update(&envelope.data) {
            warn!(symbol = %symbol, "desync detected, scheduling async resync");
            self.spawn_resync(symbol, reinit_tx.clone());
            return;
        }

        let snapshot = engines.book.snapshot();
        let ofi = engines.ofi.update(&snapshot);
        let wall_events = engines.walls.update(&symbol, &snapshot);

        let record = UpdateRecord {
            symbol: symbol.clone(),
            timestamp: Utc::now(),
            book: BookSummary::from(&snapshot),
            ofi,
            wall_events,
            wall_map_4h: engines.walls.get_wall_map(Timeframe::FourHour),
            wall_map_1h: engines.walls.get_wall_map(Timeframe::OneHour),
            wall_map_15min: engines.walls.get_wall_map(Timeframe::FifteenMin),
        };

        for subscriber in &self.subscribers {
            subscriber.on_update(&record).await;
        }
    }

    fn spawn_resync(&self, symbol: String, reinit_tx: mpsc::UnboundedSender<ReinitResult>) {
        let Some(engines) = self.engines.get(&symbol) else {
            return;
        };
        let http = engines.book.http_client();
        let rest_url = engines.book.rest_url().to_string();
        let depth = engines.book.depth();

        tokio::spawn(async move {
            let snapshot = fetch_snapshot(&http, &rest_url, &symbol, depth).await;
            let _ = reinit_tx.send(ReinitResult { symbol, snapshot });
        });
    }

    fn apply_reinit_result(&mut self, result: ReinitResult) {
        let ReinitResult { symbol, snapshot } = result;
        match snapshot {
            Ok(snapshot) => {
                if let Some(engines) = self.engines.get_mut(&symbol) {
                    engines.book.apply_snapshot(snapshot);
                    info!(symbol = %symbol, "resync completed");
                }
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "resync fetch failed");
            }
        }
    }
}
