//! Durable storage: an atomically-written latest-snapshot file plus a SQLite
//! history store for walls, OFI ticks, and manual signal annotations.

use crate::error::{EngineError, Result};
use crate::orderbook::collector::Subscriber;
use crate::orderbook::types::{LatestSnapshot, OfiState, Timeframe, UpdateRecord};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS wall_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    timeframe TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_wall_snapshots_symbol_ts ON wall_snapshots (symbol, timestamp);

CREATE TABLE IF NOT EXISTS ofi_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    raw REAL NOT NULL,
    ema REAL NOT NULL,
    std REAL NOT NULL,
    z_score REAL NOT NULL,
    signal TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ofi_history_symbol_ts ON ofi_history (symbol, timestamp);

-- source carries a stray indentation on this column's definition; the
-- semantics are an ordinary DATETIME DEFAULT CURRENT_TIMESTAMP, preserved.
CREATE TABLE IF NOT EXISTS signal_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
        timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    signal_type TEXT NOT NULL,
    price REAL,
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_signal_log_symbol_ts ON signal_log (symbol, timestamp);
";

pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    pub write_interval_sec: u64,
    pub ofi_interval_sec: u64,
    pub wall_snapshot_interval_sec: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::config::default_data_dir(),
            write_interval_sec: 2,
            ofi_interval_sec: 30,
            wall_snapshot_interval_sec: 300,
        }
    }
}

/// Tracks when each periodic write last fired, using a monotonic clock so
/// wall-clock adjustments can't cause spurious double-writes or stalls.
struct Schedule {
    write_interval: std::time::Duration,
    ofi_interval: std::time::Duration,
    wall_snapshot_interval: std::time::Duration,
    last_write: Instant,
    last_ofi: Instant,
    last_wall_snapshot: Instant,
}

impl Schedule {
    fn new(config: &PersistenceConfig) -> Self {
        let now = Instant::now();
        Self {
            write_interval: std::time::Duration::from_secs(config.write_interval_sec),
            ofi_interval: std::time::Duration::from_secs(config.ofi_interval_sec),
            wall_snapshot_interval: std::time::Duration::from_secs(config.wall_snapshot_interval_sec),
            last_write: now,
            last_ofi: now,
            last_wall_snapshot: now,
        }
    }

    fn due_write(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_write) >= self.write_interval {
            self.last_write = now;
            true
        } else {
            false
        }
    }

    fn due_ofi(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_ofi) >= self.ofi_interval {
            self.last_ofi = now;
            true
        } else {
            false
        }
    }

    fn due_wall_snapshot(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_wall_snapshot) >= self.wall_snapshot_interval {
            self.last_wall_snapshot = now;
            true
        } else {
            false
        }
    }
}

/// Persists `UpdateRecord`s to `latest.json` and `orderbook.db` on their own
/// schedules. Registered with the Collector as a `Subscriber`.
pub struct Persistence {
    data_dir: PathBuf,
    conn: Arc<Mutex<Connection>>,
    schedule: Mutex<Schedule>,
    latest: Mutex<HashMap<String, UpdateRecord>>,
}

impl Persistence {
    pub fn open(config: PersistenceConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| EngineError::StorageWriteFailure(e.to_string()))?;

        let db_path = config.data_dir.join("orderbook.db");
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;

        let schedule = Schedule::new(&config);
        Ok(Self {
            data_dir: config.data_dir,
            conn: Arc::new(Mutex::new(conn)),
            schedule: Mutex::new(schedule),
            latest: Mutex::new(HashMap::new()),
        })
    }

    fn latest_path(&self) -> PathBuf {
        self.data_dir.join("latest.json")
    }

    /// Serializes to a temp file in the same directory then renames over the
    /// target, so readers never observe a partially-written file.
    fn write_latest_atomic(&self) -> Result<()> {
        let snapshot = LatestSnapshot {
            timestamp: Utc::now(),
            data: self.latest.lock().clone(),
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;

        let tmp_path = self.latest_path().with_extension("json.tmp");
        std::fs::write(&tmp_path, &body)
            .map_err(|e| EngineError::StorageWriteFailure(e.to_string()))?;
        std::fs::rename(&tmp_path, self.latest_path())
            .map_err(|e| EngineError::StorageWriteFailure(e.to_string()))?;
        Ok(())
    }

    fn write_ofi_row(&self, symbol: &str, ofi: &OfiState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ofi_history (symbol, raw, ema, std, z_score, signal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![symbol, ofi.raw, ofi.ema, ofi.std, ofi.z_score, ofi.signal.as_str()],
        )?;
        Ok(())
    }

    /// Writes one row per timeframe, each holding that timeframe's full wall
    /// map (bids + asks + counts) as a JSON blob, per SPEC_FULL.md §4.5.
    fn write_wall_snapshot_rows(&self, symbol: &str, record: &UpdateRecord) -> Result<()> {
        let conn = self.conn.lock();
        for (timeframe, map) in [
            (Timeframe::FourHour, &record.wall_map_4h),
            (Timeframe::OneHour, &record.wall_map_1h),
            (Timeframe::FifteenMin, &record.wall_map_15min),
        ] {
            let data = serde_json::to_string(map)?;
            conn.execute(
                "INSERT INTO wall_snapshots (symbol, timeframe, data) VALUES (?1, ?2, ?3)",
                params![symbol, timeframe.as_str(), data],
            )?;
        }
        Ok(())
    }

    /// Records a manually-annotated signal event. Not produced internally by
    /// any engine; exposed for operator tooling and the query binary.
    pub fn log_signal(&self, symbol: &str, signal_type: &str, price: Option<f64>, details: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signal_log (symbol, signal_type, price, details) VALUES (?1, ?2, ?3, ?4)",
            params![symbol, signal_type, price, details],
        )?;
        Ok(())
    }

    pub fn recent_ofi(&self, symbol: &str, limit: usize) -> Result<Vec<OfiRow>> {
        query_recent_ofi(&self.conn.lock(), symbol, limit)
    }

    pub fn recent_walls(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<WallSnapshotRow>> {
        query_recent_walls(&self.conn.lock(), symbol, timeframe, limit)
    }

    fn on_update_sync(&self, record: &UpdateRecord) {
        self.latest
            .lock()
            .insert(record.symbol.clone(), record.clone());

        let mut schedule = self.schedule.lock();
        if schedule.due_write() {
            if let Err(e) = self.write_latest_atomic() {
                error!(error = %e, "failed to write latest.json");
            }
        }
        if schedule.due_ofi() {
            if let Err(e) = self.write_ofi_row(&record.symbol, &record.ofi) {
                warn!(error = %e, "failed to persist ofi history row");
            }
        }
        if schedule.due_wall_snapshot() {
            if let Err(e) = self.write_wall_snapshot_rows(&record.symbol, record) {
                warn!(error = %e, "failed to persist wall snapshot rows");
            }
        }
    }
}

impl Subscriber for Persistence {
    fn on_update<'a>(
        &'a self,
        record: &'a UpdateRecord,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        self.on_update_sync(record);
        Box::pin(std::future::ready(()))
    }
}

/// Loads `latest.json` directly, for CLI query tooling that reads daemon
/// state without opening the database.
pub fn read_latest_snapshot(data_dir: &Path) -> Result<LatestSnapshot> {
    let path = data_dir.join("latest.json");
    let body = std::fs::read(&path).map_err(|e| EngineError::StorageWriteFailure(e.to_string()))?;
    let snapshot = serde_json::from_slice(&body)?;
    Ok(snapshot)
}

pub fn open_readonly(data_dir: &Path) -> Result<Connection> {
    let conn = Connection::open(data_dir.join("orderbook.db"))?;
    Ok(conn)
}

/// `status` query-tool classification, per SPEC_FULL.md §6: `OFFLINE` if the
/// snapshot file is missing, `STALE` if older than `cutoff_secs`, else
/// `ONLINE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Online,
    Stale,
    Offline,
}

impl SnapshotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotStatus::Online => "ONLINE",
            SnapshotStatus::Stale => "STALE",
            SnapshotStatus::Offline => "OFFLINE",
        }
    }
}

/// The default 10s STALE cutoff, clamped upward for daemons configured with
/// a larger `write_interval_sec` so they don't permanently read as STALE.
pub fn stale_cutoff_secs(write_interval_sec: u64) -> i64 {
    10i64.max(5 * write_interval_sec as i64)
}

/// Reads `latest.json` and classifies its freshness against `cutoff_secs`,
/// without touching the filesystem beyond that one read. Pulled out of the
/// query binary so the OFFLINE/STALE/ONLINE transitions are unit-testable
/// without a running daemon or real-time sleeps.
pub fn snapshot_status(data_dir: &Path, cutoff_secs: i64) -> (SnapshotStatus, Option<i64>, Vec<String>) {
    match read_latest_snapshot(data_dir) {
        Err(_) => (SnapshotStatus::Offline, None, Vec::new()),
        Ok(snapshot) => {
            let age = (Utc::now() - snapshot.timestamp).num_seconds();
            let status = if age > cutoff_secs {
                SnapshotStatus::Stale
            } else {
                SnapshotStatus::Online
            };
            let mut symbols: Vec<String> = snapshot.data.keys().cloned().collect();
            symbols.sort();
            (status, Some(age), symbols)
        }
    }
}

/// `(timestamp, raw, ema, z_score, signal)`, newest first.
pub type OfiRow = (String, f64, f64, f64, String);

/// `(timestamp, json-encoded WallMap)`, newest first.
pub type WallSnapshotRow = (String, String);

/// Standalone so the read-only query binary can run it against a plain
/// `Connection` it opened itself, without constructing a `Persistence`.
pub fn query_recent_ofi(conn: &Connection, symbol: &str, limit: usize) -> Result<Vec<OfiRow>> {
    let mut stmt = conn.prepare(
        "SELECT timestamp, raw, ema, z_score, signal FROM ofi_history
         WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![symbol, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn query_recent_walls(
    conn: &Connection,
    symbol: &str,
    timeframe: Timeframe,
    limit: usize,
) -> Result<Vec<WallSnapshotRow>> {
    let mut stmt = conn.prepare(
        "SELECT timestamp, data FROM wall_snapshots
         WHERE symbol = ?1 AND timeframe = ?2 ORDER BY timestamp DESC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![symbol, timeframe.as_str(), limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::types::{BookSummary, OfiState, WallMap};
    use tempfile::TempDir;

    fn sample_record(symbol: &str) -> UpdateRecord {
        UpdateRecord {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            book: BookSummary {
                best_bid: Some(100.0),
                best_ask: Some(100.1),
                mid: Some(100.05),
                spread_bps: Some(10.0),
            },
            ofi: OfiState::default(),
            wall_events: Vec::new(),
            wall_map_4h: WallMap::default(),
            wall_map_1h: WallMap::default(),
            wall_map_15min: WallMap::default(),
        }
    }

    #[test]
    fn schema_creation_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = PersistenceConfig {
            data_dir: dir.path().to_path_buf(),
            ..PersistenceConfig::default()
        };
        let p1 = Persistence::open(PersistenceConfig {
            data_dir: dir.path().to_path_buf(),
            ..PersistenceConfig::default()
        })
        .unwrap();
        drop(p1);
        let _p2 = Persistence::open(config).unwrap();
    }

    #[test]
    fn write_latest_atomic_produces_valid_json() {
        let dir = TempDir::new().unwrap();
        let persistence = Persistence::open(PersistenceConfig {
            data_dir: dir.path().to_path_buf(),
            ..PersistenceConfig::default()
        })
        .unwrap();

        persistence
            .latest
            .lock()
            .insert("BTCUSDT".to_string(), sample_record("BTCUSDT"));
        persistence.write_latest_atomic().unwrap();

        let loaded = read_latest_snapshot(dir.path()).unwrap();
        assert!(loaded.data.contains_key("BTCUSDT"));
        assert!(!dir.path().join("latest.json.tmp").exists());
    }

    #[test]
    fn ofi_and_wall_rows_round_trip_through_sqlite() {
        let dir = TempDir::new().unwrap();
        let persistence = Persistence::open(PersistenceConfig {
            data_dir: dir.path().to_path_buf(),
            ..PersistenceConfig::default()
        })
        .unwrap();

        persistence
            .write_ofi_row("BTCUSDT", &OfiState::default())
            .unwrap();
        let rows = persistence.recent_ofi("BTCUSDT", 10).unwrap();
        assert_eq!(rows.len(), 1);

        persistence
            .write_wall_snapshot_rows("BTCUSDT", &sample_record("BTCUSDT"))
            .unwrap();
        let walls = persistence
            .recent_walls("BTCUSDT", Timeframe::OneHour, 10)
            .unwrap();
        assert_eq!(walls.len(), 1);

        persistence
            .log_signal("BTCUSDT", "manual", Some(100.0), "test entry")
            .unwrap();
    }

    #[test]
    fn scenario_6_snapshot_status_transitions() {
        let dir = TempDir::new().unwrap();
        let cutoff = stale_cutoff_secs(2);
        assert_eq!(cutoff, 10);

        // No file at all -> OFFLINE.
        let (status, age, _) = snapshot_status(dir.path(), cutoff);
        assert_eq!(status, SnapshotStatus::Offline);
        assert!(age.is_none());

        // A freshly-written snapshot -> ONLINE.
        let fresh = LatestSnapshot {
            timestamp: Utc::now(),
            data: HashMap::from([("BTCUSDT".to_string(), sample_record("BTCUSDT"))]),
        };
        std::fs::write(dir.path().join("latest.json"), serde_json::to_vec(&fresh).unwrap()).unwrap();
        let (status, age, symbols) = snapshot_status(dir.path(), cutoff);
        assert_eq!(status, SnapshotStatus::Online);
        assert!(age.unwrap() < cutoff);
        assert_eq!(symbols, vec!["BTCUSDT".to_string()]);

        // A snapshot whose timestamp is older than the cutoff -> STALE,
        // standing in for the real 15s pause in the literal scenario.
        let stale = LatestSnapshot {
            timestamp: Utc::now() - chrono::Duration::seconds(cutoff + 5),
            data: fresh.data,
        };
        std::fs::write(dir.path().join("latest.json"), serde_json::to_vec(&stale).unwrap()).unwrap();
        let (status, age, _) = snapshot_status(dir.path(), cutoff);
        assert_eq!(status, SnapshotStatus::Stale);
        assert!(age.unwrap() > cutoff);
    }
}
