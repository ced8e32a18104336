//! Query tool: reads `latest.json` and `orderbook.db` directly (no IPC to the
//! daemon) and prints one JSON object per command, always exiting 0.

use chrono::{DateTime, Utc};
use orderbook_engine::config::Config;
use orderbook_engine::orderbook::persistence::{
    open_readonly, query_recent_ofi, query_recent_walls, read_latest_snapshot, snapshot_status, stale_cutoff_secs,
};
use orderbook_engine::orderbook::types::{OfiSignal, Timeframe, WallSide};
use serde_json::{json, Value};
use std::collections::HashMap;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).cloned().unwrap_or_default();
    let flags = parse_flags(&args[2.min(args.len())..]);

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            print_json(json!({"error": format!("config error: {e}")}));
            return;
        }
    };

    let output = match command.as_str() {
        "healthcheck" => cmd_healthcheck(&config),
        "status" => cmd_status(&config),
        "wall-map" => cmd_wall_map(&config, &flags),
        "ofi" => cmd_ofi(&config, &flags),
        "orderbook" => cmd_orderbook(&config, &flags),
        "real-walls" => cmd_real_walls(&config, &flags),
        "check-signal" => cmd_check_signal(&config, &flags),
        "history" => cmd_history(&config, &flags),
        "" => json!({"error": "missing command"}),
        other => json!({"error": format!("unknown command: {other}")}),
    };

    print_json(output);
}

fn print_json(value: Value) {
    println!("{}", serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string()));
    std::process::exit(0);
}

/// Parses `--flag value` pairs. Unrecognized tokens are ignored; this tool
/// has no subcommand-specific validation beyond what each command needs.
fn parse_flags(args: &[String]) -> HashMap<String, String> {
    let mut flags = HashMap::new();
    let mut i = 0;
    while i < args.len() {
        if let Some(name) = args[i].strip_prefix("--") {
            if let Some(value) = args.get(i + 1) {
                flags.insert(name.to_string(), value.clone());
                i += 1;
            }
        }
        i += 1;
    }
    flags
}

/// A minimal liveness probe distinct from `status`: succeeds whenever the
/// data directory is readable and configuration loaded, regardless of
/// whether the daemon is currently running.
fn cmd_healthcheck(config: &Config) -> Value {
    let dir_ok = config.data_dir.is_dir() || std::fs::create_dir_all(&config.data_dir).is_ok();
    json!({"ok": dir_ok})
}

fn cmd_status(config: &Config) -> Value {
    let cutoff = stale_cutoff_secs(config.write_interval_sec);
    let (status, age, symbols) = snapshot_status(&config.data_dir, cutoff);
    match age {
        Some(age) => json!({"status": status.as_str(), "age_seconds": age, "symbols": symbols}),
        None => json!({"status": status.as_str()}),
    }
}

fn required_symbol(flags: &HashMap<String, String>) -> Result<String, Value> {
    flags
        .get("symbol")
        .map(|s| s.to_uppercase())
        .ok_or_else(|| json!({"error": "missing required --symbol"}))
}

fn load_record(config: &Config, symbol: &str) -> Result<orderbook_engine::orderbook::UpdateRecord, Value> {
    let snapshot = read_latest_snapshot(&config.data_dir)
        .map_err(|e| json!({"error": format!("{symbol}: {e}")}))?;
    snapshot
        .data
        .get(symbol)
        .cloned()
        .ok_or_else(|| json!({"error": format!("{symbol}: no data available")}))
}

fn cmd_wall_map(config: &Config, flags: &HashMap<String, String>) -> Value {
    let symbol = match required_symbol(flags) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let timeframe = Timeframe::parse_or_default(flags.get("timeframe").map(String::as_str).unwrap_or("1h"));
    let record = match load_record(config, &symbol) {
        Ok(r) => r,
        Err(e) => return e,
    };

    let map = match timeframe {
        Timeframe::FourHour => &record.wall_map_4h,
        Timeframe::OneHour => &record.wall_map_1h,
        Timeframe::FifteenMin => &record.wall_map_15min,
    };
    json!({"symbol": symbol, "timeframe": timeframe.as_str(), "wall_map": map})
}

fn cmd_ofi(config: &Config, flags: &HashMap<String, String>) -> Value {
    let symbol = match required_symbol(flags) {
        Ok(s) => s,
        Err(e) => return e,
    };
    match load_record(config, &symbol) {
        Ok(record) => json!({"symbol": symbol, "ofi": record.ofi}),
        Err(e) => e,
    }
}

fn cmd_orderbook(config: &Config, flags: &HashMap<String, String>) -> Value {
    let symbol = match required_symbol(flags) {
        Ok(s) => s,
        Err(e) => return e,
    };
    match load_record(config, &symbol) {
        Ok(record) => json!({"symbol": symbol, "book": record.book, "timestamp": record.timestamp}),
        Err(e) => e,
    }
}

/// Mirrors the original query helper's shape: a `support` object built from
/// the 4h map ("strong") and a `resistance` object from the 1h map
/// ("moderate"), each truncated to the top 3 walls, gated by `--side`.
fn cmd_real_walls(config: &Config, flags: &HashMap<String, String>) -> Value {
    let symbol = match required_symbol(flags) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let side = flags.get("side").map(String::as_str).unwrap_or("both");
    let record = match load_record(config, &symbol) {
        Ok(r) => r,
        Err(e) => return e,
    };

    const TOP_N: usize = 3;
    let mut out = serde_json::Map::new();
    out.insert("symbol".to_string(), json!(symbol));

    if side == "bid" || side == "both" {
        out.insert(
            "support".to_string(),
            json!({
                "strong_4h": record.wall_map_4h.bids.walls.iter().take(TOP_N).collect::<Vec<_>>(),
                "moderate_1h": record.wall_map_1h.bids.walls.iter().take(TOP_N).collect::<Vec<_>>(),
            }),
        );
    }
    if side == "ask" || side == "both" {
        out.insert(
            "resistance".to_string(),
            json!({
                "strong_4h": record.wall_map_4h.asks.walls.iter().take(TOP_N).collect::<Vec<_>>(),
                "moderate_1h": record.wall_map_1h.asks.walls.iter().take(TOP_N).collect::<Vec<_>>(),
            }),
        );
    }
    Value::Object(out)
}

/// `LONG` when price is within 0.5% of a bid wall in the 1h map and OFI is
/// BUY/STRONG_BUY; `SHORT` symmetrically; `WATCH` when |z|>2 with no wall
/// proximity; else `NONE`.
fn cmd_check_signal(config: &Config, flags: &HashMap<String, String>) -> Value {
    let symbol = match required_symbol(flags) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let record = match load_record(config, &symbol) {
        Ok(r) => r,
        Err(e) => return e,
    };

    const PROXIMITY: f64 = 0.005;
    let Some(price) = record.book.mid.or(record.book.best_bid).or(record.book.best_ask) else {
        return json!({"symbol": symbol, "signal": "NONE", "confidence": "LOW"});
    };

    let near_bid_wall = record
        .wall_map_1h
        .bids
        .walls
        .iter()
        .any(|w| w.side == WallSide::Bid && (price - w.price).abs() / w.price < PROXIMITY);
    let near_ask_wall = record
        .wall_map_1h
        .asks
        .walls
        .iter()
        .any(|w| w.side == WallSide::Ask && (price - w.price).abs() / w.price < PROXIMITY);

    let (signal, confidence) = match record.ofi.signal {
        OfiSignal::StrongBuy if near_bid_wall => ("LONG", "HIGH"),
        OfiSignal::Buy if near_bid_wall => ("LONG", "MEDIUM"),
        OfiSignal::StrongSell if near_ask_wall => ("SHORT", "HIGH"),
        OfiSignal::Sell if near_ask_wall => ("SHORT", "MEDIUM"),
        _ if record.ofi.z_score.abs() > 2.0 => ("WATCH", "MEDIUM"),
        _ => ("NONE", "LOW"),
    };

    json!({"symbol": symbol, "signal": signal, "confidence": confidence, "z_score": record.ofi.z_score})
}

/// Built from `recent_ofi`/`recent_walls` over a generous row limit, filtered
/// client-side by the requested `--hours` window (the store has no direct
/// time-bounded query).
fn cmd_history(config: &Config, flags: &HashMap<String, String>) -> Value {
    let symbol = match required_symbol(flags) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let hours: f64 = flags
        .get("hours")
        .and_then(|s| s.parse().ok())
        .unwrap_or(1.0);

    let conn = match open_readonly(&config.data_dir) {
        Ok(c) => c,
        Err(e) => return json!({"error": format!("{symbol}: {e}")}),
    };

    const GENEROUS_LIMIT: usize = 10_000;
    let cutoff = Utc::now() - chrono::Duration::seconds((hours * 3600.0) as i64);

    let ofi_rows = query_recent_ofi(&conn, &symbol, GENEROUS_LIMIT).unwrap_or_default();
    let ofi_in_window: Vec<Value> = ofi_rows
        .into_iter()
        .filter(|(ts, ..)| parse_sqlite_timestamp(ts).map(|t| t >= cutoff).unwrap_or(true))
        .map(|(ts, raw, ema, z_score, signal)| {
            json!({"timestamp": ts, "raw": raw, "ema": ema, "z_score": z_score, "signal": signal})
        })
        .collect();

    let mut signal_counts: HashMap<String, usize> = HashMap::new();
    for row in &ofi_in_window {
        if let Some(signal) = row.get("signal").and_then(Value::as_str) {
            *signal_counts.entry(signal.to_string()).or_insert(0) += 1;
        }
    }

    let wall_rows = query_recent_walls(&conn, &symbol, Timeframe::OneHour, GENEROUS_LIMIT).unwrap_or_default();
    let walls_in_window: Vec<Value> = wall_rows
        .into_iter()
        .filter(|(ts, _)| parse_sqlite_timestamp(ts).map(|t| t >= cutoff).unwrap_or(true))
        .map(|(ts, data)| {
            let parsed: Value = serde_json::from_str(&data).unwrap_or(Value::Null);
            json!({"timestamp": ts, "wall_map": parsed})
        })
        .collect();

    json!({
        "symbol": symbol,
        "hours": hours,
        "ofi_history": ofi_in_window,
        "wall_snapshots": walls_in_window,
        "signal_counts": signal_counts,
    })
}

fn parse_sqlite_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}
