//! Collector daemon: runs the feed client against the configured symbol set
//! and persists every tick to `latest.json` and `orderbook.db`.

use orderbook_engine::config::Config;
use orderbook_engine::orderbook::{Collector, Persistence};
use std::collections::HashMap;
use std::sync::Arc;

/// Parses `--flag value` pairs, same hand-rolled shape as the query binary;
/// unrecognized flags are ignored.
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let flags = parse_flags(&args[1.min(args.len())..]);
    let config = Config::load(&flags)?;
    tracing::info!(
        symbols = %config.symbols.join(","),
        data_dir = %config.data_dir.display(),
        "starting orderbook collector daemon"
    );

    let persistence = Arc::new(Persistence::open(config.persistence_config())?);
    let mut collector = Collector::new(config.collector_config());
    collector.subscribe(persistence);

    let stop_handle = collector.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received shutdown signal, stopping collector");
                stop_handle.store(false, std::sync::atomic::Ordering::SeqCst);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        }
    });

    collector.run().await?;
    Ok(())
}
