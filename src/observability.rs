//! Tracing setup for the kernel binary and tests.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Set to `json` to switch log output to JSON lines.
pub const LOG_FORMAT_ENV: &str = "AGENTOS_LOG_FORMAT";

/// Install the default subscriber (`info`, compact text) once per process.
///
/// `RUST_LOG` and `AGENTOS_LOG_FORMAT` override the defaults.
pub fn init_tracing() {
    init_tracing_with(&ObservabilityConfig::default());
}

/// Install a subscriber seeded from `config`. Later calls are no-ops.
pub fn init_tracing_with(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);

        let installed = if json_requested(config) {
            registry.with(fmt::layer().json()).try_init()
        } else {
            registry.with(fmt::layer().compact().with_target(false)).try_init()
        };
        if let Err(err) = installed {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

fn json_requested(config: &ObservabilityConfig) -> bool {
    match std::env::var(LOG_FORMAT_ENV) {
        Ok(format) => format.eq_ignore_ascii_case("json"),
        Err(_) => config.json_logs,
    }
}
