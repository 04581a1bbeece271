//! Tracing subscriber setup.
//!
//! Logs always go to stderr. When `logging.directory` is configured they are
//! also written to a daily rolling file named `tether.log.YYYY-MM-DD`.

use crate::config::LoggingConfig;
use crate::error::{BotError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// File name prefix for rolling log files.
pub const LOG_FILE_PREFIX: &str = "tether.log";

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured filter when it is set and valid. The
/// returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
///
/// # Errors
///
/// Fails when the configured filter does not parse, the log directory cannot
/// be created, or a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(env_directives.as_deref(), &config.filter)?;

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| BotError::Config(format!("cannot install tracing subscriber: {e}")))?;

    Ok(guard)
}

/// Pick the environment directives when usable, else the configured ones.
fn build_filter(env_directives: Option<&str>, configured: &str) -> Result<EnvFilter> {
    if let Some(directives) = env_directives.filter(|d| !d.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(directives)
    {
        return Ok(filter);
    }
    EnvFilter::try_new(configured)
        .map_err(|e| BotError::Config(format!("invalid logging.filter `{configured}`: {e}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn env_directives_win_when_valid() {
        let filter = build_filter(Some("tether=trace"), "tether=info").unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn blank_or_invalid_env_falls_back_to_config() {
        let filter = build_filter(Some("  "), "tether=debug").unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));

        let filter = build_filter(Some("tether=loud"), "warn").unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn invalid_configured_filter_is_a_config_error() {
        let err = build_filter(None, "tether=loud").unwrap_err();
        assert!(matches!(err, BotError::Config(msg) if msg.contains("tether=loud")));
    }
}
