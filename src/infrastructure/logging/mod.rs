// Logging module - Logging infrastructure
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use std::io;

/// Filter directive for `level`, applied to this crate only.
pub fn default_directive(level: &str) -> String {
    format!("seriald={},warn", level.trim().to_ascii_lowercase())
}

/// Initialize logging system. `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(level)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(true)
                .with_level(true)
        )
        .try_init()?;

    tracing::debug!("seriald logging system initialized");
    Ok(())
}
