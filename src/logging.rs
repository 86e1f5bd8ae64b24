//! tracing-subscriber setup. Logs go to stderr; stdout carries command output.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter `{directive}`: {source}")]
    Filter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("logging already initialized: {0}")]
    Init(#[from] TryInitError),
}

/// Picks the filter directive: `RUST_LOG` wins, then `-v` flags, then config.
pub fn filter_directive(config: &LoggingConfig, verbosity: u8, rust_log: Option<&str>) -> String {
    if let Some(env) = rust_log.map(str::trim).filter(|env| !env.is_empty()) {
        return env.to_string();
    }
    match verbosity {
        0 => config.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

pub fn init_logging(config: &LoggingConfig, verbosity: u8) -> Result<(), LoggingError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(config, verbosity, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive).map_err(|source| LoggingError::Filter {
        directive: directive.clone(),
        source,
    })?;

    let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            format: LogFormat::Text,
        }
    }

    #[test]
    fn rust_log_overrides_everything() {
        assert_eq!(
            filter_directive(&config("warn"), 2, Some("hostmerge=debug")),
            "hostmerge=debug"
        );
    }

    #[test]
    fn verbosity_overrides_configured_level() {
        assert_eq!(filter_directive(&config("warn"), 0, Some("  ")), "warn");
        assert_eq!(filter_directive(&config("warn"), 1, None), "debug");
        assert_eq!(filter_directive(&config("warn"), 3, None), "trace");
    }
}
