//! Server settings and configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9503;
const DEFAULT_REACTOR_NUM: usize = 8;
const DEFAULT_WORKER_NUM: usize = 8;
const DEFAULT_PID_FILE: &str = "/var/run/tcpd.pid";
const DEFAULT_LOG_FILE: &str = "/tmp/tcpd.log";
const DEFAULT_MAX_WAIT_TIME_SECS: u64 = 60;

/// Settings error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SettingsError {
    /// A numeric setting was below its allowed minimum.
    #[snafu(display("setting '{}' must be at least {} (got {})", field, minimum, value))]
    BelowMinimum {
        /// Name of the setting.
        field: &'static str,

        /// Configured value.
        value: usize,

        /// Smallest allowed value.
        minimum: usize,
    },
}

/// Operator-facing server settings.
///
/// Every field is optional: unset fields fall back to their defaults when resolved with [`Settings::resolve`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Whether each event is dispatched inside its own task.
    pub enable_coroutine: Option<bool>,

    /// Number of reactor (acceptor) threads.
    pub reactor_num: Option<usize>,

    /// Number of worker processes.
    pub worker_num: Option<usize>,

    /// Number of task worker processes.
    pub task_worker_num: Option<usize>,

    /// Path of the PID file written by the master.
    pub pid_file: Option<PathBuf>,

    /// Path of the log file.
    pub log_file: Option<PathBuf>,

    /// Whether reloads wait for in-flight work to finish.
    pub reload_async: Option<bool>,

    /// Maximum time, in seconds, to wait for a worker to stop before forcing it.
    pub max_wait_time: Option<u64>,

    /// Whether `TCP_NODELAY` is set on accepted connections.
    pub open_tcp_nodelay: Option<bool>,

    /// Number of connections a worker serves before it is recycled. Zero means unlimited.
    pub max_request: Option<usize>,
}

impl Settings {
    /// Merges these settings over the defaults and validates the result.
    ///
    /// # Errors
    ///
    /// If `reactor_num` or `worker_num` is zero, an error is returned.
    pub fn resolve(&self) -> Result<EngineSettings, SettingsError> {
        let defaults = EngineSettings::default();
        let resolved = EngineSettings {
            enable_coroutine: self.enable_coroutine.unwrap_or(defaults.enable_coroutine),
            reactor_num: self.reactor_num.unwrap_or(defaults.reactor_num),
            worker_num: self.worker_num.unwrap_or(defaults.worker_num),
            task_worker_num: self.task_worker_num.unwrap_or(defaults.task_worker_num),
            pid_file: self.pid_file.clone().unwrap_or(defaults.pid_file),
            log_file: self.log_file.clone().unwrap_or(defaults.log_file),
            reload_async: self.reload_async.unwrap_or(defaults.reload_async),
            max_wait_time: self.max_wait_time.map(Duration::from_secs).unwrap_or(defaults.max_wait_time),
            open_tcp_nodelay: self.open_tcp_nodelay.unwrap_or(defaults.open_tcp_nodelay),
            max_request: self.max_request.unwrap_or(defaults.max_request),
        };

        check_minimum("reactor_num", resolved.reactor_num, 1)?;
        check_minimum("worker_num", resolved.worker_num, 1)?;

        Ok(resolved)
    }
}

fn check_minimum(field: &'static str, value: usize, minimum: usize) -> Result<(), SettingsError> {
    if value < minimum {
        return Err(SettingsError::BelowMinimum { field, value, minimum });
    }

    Ok(())
}

/// Resolved, validated server settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    /// Whether each event is dispatched inside its own task.
    pub enable_coroutine: bool,

    /// Number of reactor (acceptor) threads.
    pub reactor_num: usize,

    /// Number of worker processes.
    pub worker_num: usize,

    /// Number of task worker processes.
    pub task_worker_num: usize,

    /// Path of the PID file written by the master.
    pub pid_file: PathBuf,

    /// Path of the log file.
    pub log_file: PathBuf,

    /// Whether reloads wait for in-flight work to finish.
    pub reload_async: bool,

    /// Maximum time to wait for a worker to stop before forcing it.
    pub max_wait_time: Duration,

    /// Whether `TCP_NODELAY` is set on accepted connections.
    pub open_tcp_nodelay: bool,

    /// Number of connections a worker serves before it is recycled. Zero means unlimited.
    pub max_request: usize,
}

impl EngineSettings {
    /// Returns the total number of worker processes, including task workers.
    pub fn total_workers(&self) -> usize {
        self.worker_num + self.task_worker_num
    }

    /// Returns `true` if workers are recycled after every connection.
    pub fn is_hot_update(&self) -> bool {
        self.max_request == 1
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enable_coroutine: true,
            reactor_num: DEFAULT_REACTOR_NUM,
            worker_num: DEFAULT_WORKER_NUM,
            task_worker_num: 0,
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            reload_async: true,
            max_wait_time: Duration::from_secs(DEFAULT_MAX_WAIT_TIME_SECS),
            open_tcp_nodelay: true,
            max_request: 0,
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Server configuration.
///
/// Immutable once the server has been started.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the application configuration.
    #[serde(default)]
    pub config_file: PathBuf,

    /// Operator settings.
    #[serde(default)]
    pub settings: Settings,
}

impl ServerConfig {
    /// Creates a new `ServerConfig` for the given address and application configuration path, with default settings.
    pub fn new<H, P>(host: H, port: u16, config_file: P) -> Self
    where
        H: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            host: host.into(),
            port,
            config_file: config_file.into(),
            settings: Settings::default(),
        }
    }

    /// Sets the operator settings.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the listen address as `host:port`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT, PathBuf::new())
    }
}
