//! Server lifecycle controller.

use std::sync::Arc;

use snafu::{ResultExt as _, Snafu};
use tcpd_error::GenericError;
use tracing::info;

use crate::{
    application::{ApplicationFactory, ErrorReporter, LogErrorReporter, LogProcessNamer, ProcessNamer},
    bridge::{Bridge, Scheduler, TokioScheduler},
    callbacks::{CallbackError, CallbackRegistry, Hook},
    dispatcher::{Dispatcher, DispatcherContext},
    engine::Engine,
    event::EventKind,
    role::DEFAULT_SERVICE_NAME,
    settings::{EngineSettings, ServerConfig, SettingsError},
    shutdown::{ProcessShutdown, ShutdownHandle},
};

/// Server errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ServerError {
    /// The settings are invalid.
    #[snafu(display("Invalid server settings: {}", source))]
    InvalidSettings {
        /// Error source.
        source: SettingsError,
    },

    /// A callback could not be registered.
    #[snafu(display("Invalid callback: {}", source))]
    InvalidCallback {
        /// Error source.
        source: CallbackError,
    },

    /// The start hook failed, so the engine was never started.
    #[snafu(display("Start callback failed: {:#}", source))]
    StartCallback {
        /// Error source.
        source: GenericError,
    },
}

/// A TCP server.
///
/// Owns the server configuration and the collaborators handed to every process, binds a [`Dispatcher`] to an
/// [`Engine`], and runs the engine until it stops.
pub struct TcpServer {
    config: ServerConfig,
    service: String,
    factory: Arc<dyn ApplicationFactory>,
    reporter: Arc<dyn ErrorReporter>,
    namer: Arc<dyn ProcessNamer>,
    scheduler: Arc<dyn Scheduler>,
    callbacks: CallbackRegistry,
    shutdown: ProcessShutdown,
    shutdown_handle: ShutdownHandle,
}

impl TcpServer {
    /// Creates a new `TcpServer`.
    pub fn new<F>(config: ServerConfig, factory: F) -> Self
    where
        F: ApplicationFactory + 'static,
    {
        let (shutdown, shutdown_handle) = ProcessShutdown::paired();

        Self {
            config,
            service: DEFAULT_SERVICE_NAME.to_string(),
            factory: Arc::new(factory),
            reporter: Arc::new(LogErrorReporter),
            namer: Arc::new(LogProcessNamer),
            scheduler: Arc::new(TokioScheduler),
            callbacks: CallbackRegistry::new(),
            shutdown,
            shutdown_handle,
        }
    }

    /// Sets the service name used in process titles.
    pub fn with_service_name<S: Into<String>>(mut self, service: S) -> Self {
        self.service = service.into();
        self
    }

    /// Sets the error reporter.
    pub fn with_error_reporter<R: ErrorReporter + 'static>(mut self, reporter: R) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Sets the process namer.
    pub fn with_process_namer<N: ProcessNamer + 'static>(mut self, namer: N) -> Self {
        self.namer = Arc::new(namer);
        self
    }

    /// Sets the scheduler used to bridge dispatches into tasks.
    pub fn with_scheduler<S: Scheduler + 'static>(mut self, scheduler: S) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    /// Registers a hook for the given event kind.
    ///
    /// # Errors
    ///
    /// If the hook has the wrong shape for `kind`, or `kind` already has a hook, an error is returned.
    pub fn with_callback(mut self, kind: EventKind, hook: Hook) -> Result<Self, ServerError> {
        self.callbacks.register(kind, hook).context(InvalidCallback)?;
        Ok(self)
    }

    /// Registers a hook by its settings key, such as `worker_start_callback`.
    ///
    /// # Errors
    ///
    /// If the key is unknown, or registration fails, an error is returned.
    pub fn with_named_callback(mut self, name: &str, hook: Hook) -> Result<Self, ServerError> {
        self.callbacks.register_named(name, hook).context(InvalidCallback)?;
        Ok(self)
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns a handle that stops the server when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown_handle.clone()
    }

    /// Stops the server.
    ///
    /// Workers get up to `max_wait_time` to finish in-flight work before they are forced to stop.
    pub fn stop(&self) {
        self.shutdown_handle.trigger();
    }

    /// Starts the server on the given engine, blocking until the engine stops.
    ///
    /// Returns the engine's own success flag.
    ///
    /// # Errors
    ///
    /// If the settings are invalid, or the start hook fails, an error is returned and the engine is not started.
    pub fn start<E>(self, engine: E) -> Result<bool, ServerError>
    where
        E: Engine + 'static,
    {
        let settings = self.config.settings.resolve().context(InvalidSettings)?;

        // Concurrency is managed by the dispatcher, so the engine never runs its own.
        let mut engine = Box::new(engine);
        engine.configure(EngineSettings {
            enable_coroutine: false,
            ..settings.clone()
        });

        let dispatcher = Dispatcher::new(DispatcherContext {
            service: self.service.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            config_file: self.config.config_file.clone(),
            worker_num: settings.worker_num,
            bridge: Bridge::new(self.scheduler, settings.enable_coroutine),
            callbacks: self.callbacks.clone(),
            factory: self.factory,
            reporter: self.reporter,
            namer: self.namer,
        });
        engine.bind(Arc::new(dispatcher));

        log_banner(&self.service, engine.name(), &self.config, &settings);

        self.callbacks.notify(EventKind::Start).context(StartCallback)?;

        Ok(engine.start(self.shutdown))
    }
}

fn log_banner(service: &str, engine: &str, config: &ServerConfig, settings: &EngineSettings) {
    info!(
        server = service,
        system = std::env::consts::OS,
        engine,
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_address(),
        reactor_num = settings.reactor_num,
        worker_num = settings.worker_num,
        task_worker_num = settings.task_worker_num,
        config_file = %config.config_file.display(),
        "Server starting."
    );

    if settings.enable_coroutine {
        info!("Coroutine mode enabled: every event is dispatched in its own task.");
    }

    if settings.is_hot_update() {
        info!("Hot update enabled: workers are recycled after every connection.");
    }
}
