//! Tracing setup.
//!
//! Stdout gets human-readable output filtered by verbosity (or `RUST_LOG`);
//! an optional JSON-lines file receives the same events at debug level for
//! post-run analysis.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

pub const DEFAULT_LOG_JSON_FILTER: &str = "info,store_sync=debug";

/// Map `-v` counts to a filter directive.
pub fn verbosity_filter(verbosity: u8) -> String {
    let (global, local) = match verbosity {
        0 => ("warn", "info"),
        1 => ("warn", "debug"),
        2 => ("info", "trace"),
        _ => ("debug", "trace"),
    };
    format!("{global},store_sync={local}")
}

/// Initialize the global subscriber. Safe to call once per process.
pub fn init_tracing(verbosity: u8, json_log_path: Option<&Path>) {
    let log_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(verbosity)));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(log_filter);

    let json_layer = json_log_path.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new(DEFAULT_LOG_JSON_FILTER)),
            ),
            Err(err) => {
                // Subscriber is not installed yet.
                eprintln!("failed to open json log {}: {err}", path.display());
                None
            }
        }
    });
    let json_enabled = json_layer.is_some();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(json_layer)
        .init();

    if json_log_path.is_some() && !json_enabled {
        warn!("json logging disabled");
    }
}
