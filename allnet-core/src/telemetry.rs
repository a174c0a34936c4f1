//! Process-wide tracing setup, initialized once per binary `main` (§2).
//!
//! Grounded on `telemetry::tracing::init_tracing_with_otel`, trimmed to the
//! plain-text `fmt` layer plus `EnvFilter`: this crate carries no
//! OpenTelemetry dependency, matching the weight a packet router plausibly
//! wants over an HTTP edge proxy.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Initialize the global tracing subscriber from a configured log level,
/// honoring `RUST_LOG` if set.
pub fn init_tracing(log_level: &str, show_target: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_string()));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(show_target);

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to set global tracing subscriber: {e}"))?;
    Ok(())
}

/// Flush buffered output before process exit.
pub fn shutdown_tracing() {
    use std::io::Write;
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}
