//! Tracing subscriber setup for applications embedding the ICE manager
//!
//! The `[logging]` section of [`IceManagerConfig`](crate::IceManagerConfig)
//! deserializes into [`LoggingConfig`]. `RUST_LOG` still applies; the
//! configured level is added for this crate's own targets on top of it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{IceError, Result};

/// Target name of everything this crate logs
pub const LOG_TARGET: &str = "vpe_ice_core";

/// Output encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for ICE negotiation logs (`error` ... `trace`)
    pub level: String,
    /// Additional `target=level` directives, e.g. for the engine binding
    pub directives: Vec<String>,
    pub format: LogFormat,
    pub file_info: bool,
    /// Log span open/close, useful around retries
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directives: Vec::new(),
            format: LogFormat::Text,
            file_info: false,
            span_events: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Filter from `RUST_LOG` plus the crate level and extra directives
    pub fn env_filter(&self) -> Result<EnvFilter> {
        parse_log_level(&self.level)?;
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

        let own = format!("{}={}", LOG_TARGET, self.level.to_ascii_lowercase());
        filter = filter.add_directive(parse_directive(&own)?);
        for raw in &self.directives {
            filter = filter.add_directive(parse_directive(raw)?);
        }
        Ok(filter)
    }

    pub fn validate(&self) -> Result<()> {
        parse_log_level(&self.level)?;
        for raw in &self.directives {
            parse_directive(raw)?;
        }
        Ok(())
    }
}

fn parse_directive(raw: &str) -> Result<Directive> {
    raw.parse()
        .map_err(|e| IceError::config(format!("Invalid log directive '{}': {}", raw, e)))
}

/// Install the global subscriber.
///
/// Returns `IceError::Config` if a subscriber is already installed, so an
/// embedding application keeps its own.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let span_events = if config.span_events { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| IceError::config(format!("Tracing subscriber not installed: {}", e)))?;

    tracing::debug!(target: LOG_TARGET, "ICE logging at {} ({:?})", config.level, config.format);
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| IceError::config(format!("Invalid log level: {}", level)))
}
