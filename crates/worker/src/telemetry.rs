// Console logging setup
//
// Filter comes from RUST_LOG, then LOG_LEVEL applied to the warden crates,
// then the default below.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "warden_worker=info,warden_runtime=info,warden_durable=info";

fn log_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    match std::env::var("LOG_LEVEL") {
        Ok(level) => EnvFilter::try_new(format!(
            "warden_worker={0},warden_runtime={0},warden_durable={0}",
            level
        ))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        Err(_) => EnvFilter::new(DEFAULT_FILTER),
    }
}

/// Install the global subscriber; logs go to stderr so stdout stays machine-readable
pub fn init_telemetry() {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(log_filter());

    tracing_subscriber::registry().with(console_layer).init();
}
