use tracing_subscriber::{fmt, EnvFilter};

/// Human-readable log setup for the daemon.
///
/// `RUST_LOG` takes precedence when set; otherwise `default_level` seeds
/// the filter (plain levels like `info`, or directives like
/// `foreman_agents=debug,warn`). Repeat calls are no-ops, so tests may
/// initialise freely.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging ready");
}

/// JSON log setup, one object per line, for when the daemon's output is
/// shipped to a log collector. Selected via `FOREMAN_LOG_JSON`.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging ready (json)");
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
