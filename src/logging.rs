// 📝 Logging
// Subscriber setup shared by the CLI and the HTTP receiver.
// Events go to stderr so command output on stdout stays machine-readable.

use std::env;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_JSON: &str = "SALES_SYNC_LOG_JSON";

fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

pub fn json_requested() -> bool {
    env_bool(ENV_LOG_JSON)
}

/// Install the global subscriber. Filter comes from RUST_LOG, default `info`.
/// Calling twice is harmless: the second install is reported and ignored.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("⚠️  logging already initialised: {}", e);
    }
}
