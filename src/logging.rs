//! Tracing infrastructure.
//!
//! Structured, thread-aware logging for the daemon using the `tracing` and
//! `tracing-subscriber` crates. The subscriber is initialized once from the
//! service settings; the `RUST_LOG` environment variable overrides the
//! configured level when present.

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Compact single-line format (interactive use, journald).
    Compact,
    /// JSON format for log aggregation.
    Json,
}

impl OutputFormat {
    /// Parse the `log_format` configuration value.
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log_format '{other}'; must be 'compact' or 'json'"
            )),
        }
    }
}

/// Initialize the global subscriber.
///
/// Idempotent: if a subscriber is already installed (tests initialize
/// eagerly), this returns `Ok(())` instead of erroring.
pub fn init(level: &str, format: OutputFormat) -> Result<(), String> {
    let level = parse_log_level(level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let result = match format {
        OutputFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_thread_names(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
        OutputFormat::Json => {
            let fmt_layer = fmt::layer().json().with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
    };

    result.or_else(|e| {
        if e.to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            Ok(())
        } else {
            Err(format!("failed to initialize tracing: {e}"))
        }
    })
}

/// Parse a log level string into a tracing [`Level`].
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "invalid log level '{level}'; must be one of: trace, debug, info, warn, error"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_levels() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Warn"), Ok(Level::WARN)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn parses_output_formats() {
        assert_eq!(OutputFormat::parse("compact"), Ok(OutputFormat::Compact));
        assert_eq!(OutputFormat::parse("JSON"), Ok(OutputFormat::Json));
        assert!(OutputFormat::parse("pretty-ish").is_err());
    }

    #[test]
    fn init_is_idempotent() {
        assert!(init("info", OutputFormat::Compact).is_ok());
        assert!(init("debug", OutputFormat::Compact).is_ok());
    }
}
