//! TCP echo server.
//!
//! Runs the echo application on a [`LocalEngine`]: a master that accepts connections, a manager, and a pool of
//! workers, each on their own thread.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{path::Path, process::ExitCode, thread};

use clap::Parser as _;
use tcpd_app::prelude::*;
use tcpd_config::{ConfigurationLoader, GenericConfiguration};
use tcpd_core::{ServerConfig, ShutdownHandle, TcpServer};
use tcpd_error::{ErrorContext as _, GenericError};
use tcpd_io::LocalEngine;
use tracing::{info, warn};

mod cli;
use self::cli::Cli;

mod echo;
use self::echo::EchoApplication;

/// Environment variable prefix for server configuration.
const TCPD_ENV_VAR_PREFIX: &str = "TCPD";

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => fatal_and_exit(format!("{:#}", e)),
    }
}

fn run(cli: Cli) -> Result<bool, GenericError> {
    let configuration = load_configuration(cli.settings_file.as_deref())?;
    let mut server_config: ServerConfig = configuration
        .as_typed()
        .error_context("Failed to parse server configuration.")?;
    if let Some(host) = cli.host {
        server_config.host = host;
    }
    if let Some(port) = cli.port {
        server_config.port = port;
    }
    if let Some(config_file) = cli.config_file {
        server_config.config_file = config_file;
    }

    let settings = server_config
        .settings
        .resolve()
        .error_context("Failed to validate server settings.")?;
    let logging_config = LoggingConfiguration::from_configuration(&configuration)?.with_log_file(settings.log_file);
    let _logging_guard = initialize_logging(&logging_config)?;

    let engine = LocalEngine::new(server_config.host.clone(), server_config.port);
    let server = TcpServer::new(server_config, EchoApplication::from_config_file);
    spawn_signal_listener(server.shutdown_handle())?;

    let healthy = server.start(engine).error_context("Failed to start server.")?;
    if healthy {
        info!("Server stopped.");
    } else {
        warn!("Server stopped with errors.");
    }

    Ok(healthy)
}

fn load_configuration(settings_file: Option<&Path>) -> Result<GenericConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = settings_file {
        loader = loader
            .from_yaml(path)
            .with_error_context(|| format!("Failed to load server settings from '{}'.", path.display()))?;
    }

    Ok(loader
        .from_environment(TCPD_ENV_VAR_PREFIX)
        .error_context("Environment variable prefix should not be empty.")?
        .into_generic())
}

/// Triggers shutdown on the first Ctrl-C or `SIGTERM`.
fn spawn_signal_listener(shutdown: ShutdownHandle) -> Result<(), GenericError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .error_context("Failed to build signal handling runtime.")?;

    thread::Builder::new()
        .name("tcpd-signals".to_string())
        .spawn(move || {
            runtime.block_on(wait_for_termination());
            info!("Received shutdown signal. Stopping server.");
            shutdown.trigger();
        })
        .error_context("Failed to spawn signal handling thread.")?;

    Ok(())
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler. Only Ctrl-C will stop the server."),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C.");
        std::future::pending::<()>().await;
    }
}
