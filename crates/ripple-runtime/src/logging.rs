//! Tracing bootstrap
//!
//! Filter directives come from `RIPPLE_LOG` (for example
//! `RIPPLE_LOG=ripple_engine=debug,info`), falling back to `info`.

use std::env;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" | "pretty" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

impl LogFormat {
    /// Format named by `RIPPLE_LOG_FORMAT`, plain otherwise
    pub fn from_env() -> Self {
        env::var("RIPPLE_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env("RIPPLE_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns `false` when one was already set.
pub fn init_tracing(format: LogFormat) -> bool {
    let installed = match format {
        LogFormat::Plain => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(true)
            .with_thread_names(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_thread_names(true)
            .with_current_span(true)
            .try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!(" Plain ".parse::<LogFormat>(), Ok(LogFormat::Plain));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_install_is_refused() {
        init_tracing(LogFormat::Plain);
        assert!(!init_tracing(LogFormat::Json));
    }
}
