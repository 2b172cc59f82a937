//! Shared tracing-subscriber setup for all three binaries.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global tracing subscriber driven by `log` (an `EnvFilter`
/// directive string such as `"info"` or `"debug,chatfabric=trace"`), falling
/// back to `RUST_LOG` when `log` is empty.
pub fn init(log: &str) {
    let filter = if log.is_empty() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new(log.to_string())
    };

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    if std::env::var("CHATFABRIC_LOG_JSON").is_ok() {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
