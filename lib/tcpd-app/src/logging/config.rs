use std::path::PathBuf;

use serde::Deserialize;
use tcpd_config::GenericConfiguration;
use tcpd_error::{generic_error, ErrorContext as _, GenericError};
use tracing_subscriber::EnvFilter;

const fn default_true() -> bool {
    true
}

/// Logging configuration.
///
/// Read from the top level of the configuration: `log_level`, `log_format_json`, `log_to_console`, and `log_file`.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfiguration {
    /// Level filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Whether to emit logs as JSON rather than human-readable text.
    #[serde(default)]
    pub log_format_json: bool,

    /// Whether to log to standard output.
    #[serde(default = "default_true")]
    pub log_to_console: bool,

    /// Path to a file to additionally write logs to.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        config
            .as_typed()
            .error_context("Failed to parse logging configuration.")
    }

    /// Sets the file to additionally write logs to.
    pub fn with_log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_format_json: false,
            log_to_console: true,
            log_file: None,
        }
    }
}

/// A validated set of level filtering directives.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(String);

impl LogLevel {
    pub(super) fn as_env_filter(&self) -> EnvFilter {
        // Directives were validated on construction.
        EnvFilter::try_new(&self.0).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::try_new(&value).error_context("Failed to parse valid log level.")?;
        Ok(Self(value))
    }
}
