//! Configuration management: environment-driven settings for the collector
//! daemon, with CLI-flag overrides layered on top.

use crate::error::{EngineError, Result};
use crate::orderbook::persistence::PersistenceConfig;
use std::collections::HashMap;
use std::path::PathBuf;

/// Venue connectivity, symbol set, per-symbol wall thresholds, and
/// persistence scheduling, assembled from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub symbols: Vec<String>,
    pub thresholds: HashMap<String, f64>,
    pub rest_url: String,
    pub ws_url: String,
    pub depth: usize,
    pub data_dir: PathBuf,
    pub write_interval_sec: u64,
    pub ofi_interval_sec: u64,
    pub wall_snapshot_interval_sec: u64,
}

impl Config {
    /// Reads configuration from environment variables only, with no CLI-flag
    /// overrides. Equivalent to `load(&HashMap::new())`.
    pub fn from_env() -> Result<Self> {
        Self::load(&HashMap::new())
    }

    /// Resolves configuration from `--flag value` pairs layered over
    /// environment variables layered over hardcoded defaults, matching the
    /// original daemon launcher's `argparse`-with-env-var-defaults precedence.
    ///
    /// - `--symbols` / `ORDERBOOK_SYMBOLS` — comma-separated, e.g. `BTCUSDT,ETHUSDT`
    /// - `--thresholds-json` / `ORDERBOOK_THRESHOLDS_JSON` — JSON object mapping symbol to USD wall threshold
    /// - `ORDERBOOK_BINANCE_REST_URL`, `ORDERBOOK_BINANCE_WS_URL`
    /// - `ORDERBOOK_DEPTH` — book depth levels (default 20)
    /// - `--data-dir` / `ORDERBOOK_DATA_DIR` — persistence directory (default `~/.mcp-server-ccxt/orderbook`)
    /// - `--write-interval-sec` / `ORDERBOOK_WRITE_INTERVAL_SEC` (default 2)
    /// - `--ofi-interval-sec` / `ORDERBOOK_OFI_INTERVAL_SEC` (default 30)
    /// - `--wall-snapshot-interval-sec` / `ORDERBOOK_WALL_SNAPSHOT_INTERVAL_SEC` (default 300)
    pub fn load(flags: &HashMap<String, String>) -> Result<Self> {
        let symbols = resolve(flags, "symbols", "ORDERBOOK_SYMBOLS", "BTCUSDT")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        if symbols.is_empty() {
            return Err(EngineError::Config(
                "ORDERBOOK_SYMBOLS resolved to an empty symbol set".to_string(),
            ));
        }

        let thresholds = match resolve_opt(flags, "thresholds-json", "ORDERBOOK_THRESHOLDS_JSON") {
            Some(raw) => serde_json::from_str::<HashMap<String, f64>>(&raw)
                .map_err(|e| EngineError::Config(format!("ORDERBOOK_THRESHOLDS_JSON: {e}")))?,
            None => HashMap::new(),
        };

        let depth = env_parse("ORDERBOOK_DEPTH", 20usize)?;
        let data_dir = resolve_opt(flags, "data-dir", "ORDERBOOK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            symbols,
            thresholds,
            rest_url: std::env::var("ORDERBOOK_BINANCE_REST_URL")
                .unwrap_or_else(|_| crate::orderbook::book_state::DEFAULT_REST_URL.to_string()),
            ws_url: std::env::var("ORDERBOOK_BINANCE_WS_URL")
                .unwrap_or_else(|_| crate::orderbook::collector::DEFAULT_WS_URL.to_string()),
            depth,
            data_dir,
            write_interval_sec: resolve_parse(flags, "write-interval-sec", "ORDERBOOK_WRITE_INTERVAL_SEC", 2u64)?,
            ofi_interval_sec: resolve_parse(flags, "ofi-interval-sec", "ORDERBOOK_OFI_INTERVAL_SEC", 30u64)?,
            wall_snapshot_interval_sec: resolve_parse(
                flags,
                "wall-snapshot-interval-sec",
                "ORDERBOOK_WALL_SNAPSHOT_INTERVAL_SEC",
                300u64,
            )?,
        })
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            data_dir: self.data_dir.clone(),
            write_interval_sec: self.write_interval_sec,
            ofi_interval_sec: self.ofi_interval_sec,
            wall_snapshot_interval_sec: self.wall_snapshot_interval_sec,
        }
    }

    pub fn collector_config(&self) -> crate::orderbook::collector::CollectorConfig {
        crate::orderbook::collector::CollectorConfig {
            symbols: self.symbols.clone(),
            thresholds: self.thresholds.clone(),
            rest_url: self.rest_url.clone(),
            ws_url: self.ws_url.clone(),
            depth: self.depth,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| EngineError::Config(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// `--flag` value if present, else the environment variable, else `default`.
fn resolve(flags: &HashMap<String, String>, flag: &str, env_key: &str, default: &str) -> String {
    resolve_opt(flags, flag, env_key).unwrap_or_else(|| default.to_string())
}

/// `--flag` value if present, else the environment variable, else `None`.
fn resolve_opt(flags: &HashMap<String, String>, flag: &str, env_key: &str) -> Option<String> {
    flags
        .get(flag)
        .cloned()
        .or_else(|| std::env::var(env_key).ok())
}

fn resolve_parse<T: std::str::FromStr>(
    flags: &HashMap<String, String>,
    flag: &str,
    env_key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match resolve_opt(flags, flag, env_key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| EngineError::Config(format!("{env_key}: {e}"))),
        None => Ok(default),
    }
}

/// `~/.mcp-server-ccxt/orderbook`, falling back to a relative `./data` if
/// `HOME` isn't set (matches the original daemon's `Path.home()` default,
/// which on a headless/CI box without `$HOME` would itself fail — this falls
/// back instead of erroring).
pub fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".mcp-server-ccxt").join("orderbook"))
        .unwrap_or_else(|_| PathBuf::from("./data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        std::env::remove_var("ORDERBOOK_TEST_UNSET_KEY");
        let value: u64 = env_parse("ORDERBOOK_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_parse_rejects_malformed_values() {
        std::env::set_var("ORDERBOOK_TEST_BAD_KEY", "not-a-number");
        let result: Result<u64> = env_parse("ORDERBOOK_TEST_BAD_KEY", 1);
        assert!(result.is_err());
        std::env::remove_var("ORDERBOOK_TEST_BAD_KEY");
    }

    #[test]
    fn resolve_prefers_flag_over_env_over_default() {
        std::env::set_var("ORDERBOOK_TEST_RESOLVE_KEY", "from-env");
        let mut flags = HashMap::new();
        assert_eq!(
            resolve(&flags, "test-resolve", "ORDERBOOK_TEST_RESOLVE_KEY", "from-default"),
            "from-env"
        );
        flags.insert("test-resolve".to_string(), "from-flag".to_string());
        assert_eq!(
            resolve(&flags, "test-resolve", "ORDERBOOK_TEST_RESOLVE_KEY", "from-default"),
            "from-flag"
        );
        std::env::remove_var("ORDERBOOK_TEST_RESOLVE_KEY");
    }

    #[test]
    fn thresholds_json_parses_into_map() {
        let mut flags = HashMap::new();
        flags.insert("symbols".to_string(), "BTCUSDT,ETHUSDT".to_string());
        flags.insert(
            "thresholds-json".to_string(),
            r#"{"BTCUSDT": 500000, "ETHUSDT": 150000}"#.to_string(),
        );
        let config = Config::load(&flags).unwrap();
        assert_eq!(config.thresholds.get("BTCUSDT"), Some(&500000.0));
        assert_eq!(config.thresholds.get("ETHUSDT"), Some(&150000.0));
    }

    #[test]
    fn malformed_thresholds_json_is_an_error() {
        let mut flags = HashMap::new();
        flags.insert("thresholds-json".to_string(), "not json".to_string());
        assert!(Config::load(&flags).is_err());
    }

    #[test]
    fn default_intervals_match_spec() {
        let config = Config::load(&HashMap::new()).unwrap();
        assert_eq!(config.write_interval_sec, 2);
        assert_eq!(config.ofi_interval_sec, 30);
        assert_eq!(config.wall_snapshot_interval_sec, 300);
    }
}
