//! Tracing helpers
// (c) 2024 Ross Younger

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable that controls what gets logged
const STANDARD_ENV_VAR: &str = "RUST_LOG";

/// Log filter setup:
/// Use the `RUST_LOG` environment variable if set; otherwise log only qpx
/// items at the given level.
fn filter_for(trace_level: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_from_env(STANDARD_ENV_VAR).or_else(|e| {
        // The env var was unset or invalid. Which is it?
        if std::env::var(STANDARD_ENV_VAR).is_ok() {
            anyhow::bail!("{STANDARD_ENV_VAR} (set in environment) was invalid: {e}");
        }
        // It was unset. Fall back.
        Ok(EnvFilter::new(format!("qpx={trace_level}")))
    })
}

/// Sets up the tracing subsystem, logging to stderr
pub fn setup(trace_level: &str) -> anyhow::Result<()> {
    let filter = filter_for(trace_level)?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
        .init();
    Ok(())
}

/// Set up tracing for unit tests. Idempotent.
#[cfg(test)]
pub(crate) fn setup_tracing_for_tests() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(STANDARD_ENV_VAR)
            .unwrap_or_else(|_| EnvFilter::new("qpx=debug"));
        tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer().with_filter(filter))
            .init();
    });
}
