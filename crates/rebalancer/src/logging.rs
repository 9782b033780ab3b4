use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over [`LoggingConfig::default_filter`].
/// Returns a [`WorkerGuard`] that **must** be held for the lifetime of the
/// process; dropping it flushes and closes the log file writer.
pub fn init_tracing(logging: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.log_dir)
        .with_context(|| format!("creating log dir {}", logging.log_dir))?;

    let file_appender = tracing_appender::rolling::daily(&logging.log_dir, "rebalancer.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.default_filter))
        .context("invalid log filter directive")?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .json(),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact(),
        )
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(guard)
}
