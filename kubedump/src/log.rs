//! Configures the global default tracing subscriber

use thiserror::Error;

pub use tracing_subscriber::{
    filter::ParseError as InvalidLogFilter, util::TryInitError as LogInitError,
    EnvFilter as LogFilter,
};

/// The filter used when none is configured
pub const DEFAULT_LOG_FILTER: &str = "kubedump=info,warn";

/// Configures logging settings
#[derive(Clone, Debug)]
#[cfg_attr(feature = "cli", derive(clap::Args))]
pub struct LogArgs {
    /// The log format to use
    #[cfg_attr(feature = "cli", clap(long, default_value = "plain"))]
    pub log_format: LogFormat,

    /// The filter that determines what tracing spans and events are enabled
    #[cfg_attr(
        feature = "cli",
        clap(
            long,
            env = "KUBEDUMP_LOG",
            default_value = DEFAULT_LOG_FILTER,
            value_parser = parse_filter
        )
    )]
    pub log_level: String,
}

/// Configures whether logs should be emitted in plaintext (the default) or as JSON-encoded
/// messages
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// The default plaintext format
    #[default]
    Plain,

    /// The JSON-encoded format
    Json,
}

/// Indicates that an invalid log format was specified
#[derive(Debug, Error)]
#[error("invalid log format: {0} must be 'plain' or 'json'")]
pub struct InvalidLogFormat(String);

// === impl LogArgs ===

impl Default for LogArgs {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_level: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl LogArgs {
    /// Returns the log level filter
    pub fn log_filter(&self) -> Result<LogFilter, InvalidLogFilter> {
        LogFilter::try_new(&self.log_level)
    }

    /// Configures the global default tracing subscriber
    pub fn try_init(&self) -> Result<(), LogArgsError> {
        let filter = self.log_filter()?;
        self.log_format.try_init(filter)?;
        Ok(())
    }
}

/// Indicates that logging could not be configured
#[derive(Debug, Error)]
pub enum LogArgsError {
    /// The filter could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(#[from] InvalidLogFilter),

    /// A global subscriber was already set
    #[error(transparent)]
    Init(#[from] LogInitError),
}

#[cfg(feature = "cli")]
fn parse_filter(s: &str) -> Result<String, InvalidLogFilter> {
    LogFilter::try_new(s)?;
    Ok(s.to_string())
}

// === impl LogFormat ===

impl std::str::FromStr for LogFormat {
    type Err = InvalidLogFormat;

    fn from_str(s: &str) -> Result<Self, InvalidLogFormat> {
        match s {
            "json" => Ok(LogFormat::Json),
            "plain" => Ok(LogFormat::Plain),
            s => Err(InvalidLogFormat(s.to_string())),
        }
    }
}

impl LogFormat {
    /// Attempts to configure the global default tracing subscriber in the current scope, returning
    /// an error if one is already set
    ///
    /// This method returns an error if a global default subscriber has already been set, or if a
    /// `log` logger has already been set.
    pub fn try_init(self, filter: LogFilter) -> Result<(), LogInitError> {
        use tracing_subscriber::prelude::*;

        let registry = tracing_subscriber::registry().with(filter);

        match self {
            LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).try_init()?,

            LogFormat::Json => {
                let event_fmt = tracing_subscriber::fmt::format()
                    .json()
                    .with_span_list(true)
                    .with_current_span(false);

                let fmt = tracing_subscriber::fmt::layer()
                    .event_format(event_fmt)
                    .fmt_fields(tracing_subscriber::fmt::format::JsonFields::default());

                registry.with(fmt).try_init()?
            }
        };

        Ok(())
    }
}
