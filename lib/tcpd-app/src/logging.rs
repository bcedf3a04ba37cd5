//! Logging.

use tcpd_error::{generic_error, GenericError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

mod layer;
use self::layer::build_formatting_layer;

/// Keeps the non-blocking log writers alive.
///
/// Must be held until the process is about to exit. Dropping it flushes any pending logs.
#[derive(Default)]
pub struct LoggingGuard {
    worker_guards: Vec<WorkerGuard>,
}

impl LoggingGuard {
    fn add_worker_guard(&mut self, guard: WorkerGuard) {
        self.worker_guards.push(guard);
    }
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// One output layer is built per configured destination (console, file), and the level filter is applied once on top
/// of all of them. The `TCPD_LOG_LEVEL` environment variable, when set, takes precedence over the configured level.
///
/// # Errors
///
/// If the log file cannot be opened, or the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<LoggingGuard, GenericError> {
    let level_filter = match std::env::var("TCPD_LOG_LEVEL") {
        Ok(directives) if !directives.trim().is_empty() => LogLevel::try_from(directives)?.as_env_filter(),
        _ => config.log_level.as_env_filter(),
    };

    let mut configured_layers = Vec::new();
    let mut logging_guard = LoggingGuard::default();

    if config.log_to_console {
        let (nb_stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
        logging_guard.add_worker_guard(guard);

        configured_layers.push(build_formatting_layer(config, nb_stdout, true));
    }

    if let Some(log_file) = &config.log_file {
        let directory = log_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_file
            .file_name()
            .ok_or_else(|| generic_error!("Log file path '{}' has no file name.", log_file.display()))?;

        let appender = tracing_appender::rolling::never(directory, file_name);
        let (nb_appender, guard) = tracing_appender::non_blocking(appender);
        logging_guard.add_worker_guard(guard);

        configured_layers.push(build_formatting_layer(config, nb_appender, false));
    }

    tracing_subscriber::registry()
        .with(configured_layers.with_filter(level_filter))
        .try_init()
        .map_err(|e| generic_error!("Failed to initialize logging: {}", e))?;

    Ok(logging_guard)
}
