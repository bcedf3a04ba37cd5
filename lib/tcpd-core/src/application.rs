//! Application-facing interfaces.

use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tcpd_error::GenericError;
use tracing::{error, info};

use crate::{engine::ServerRef, event::ConnectionId};

/// Request context for a single connection event.
#[derive(Clone)]
pub struct TcpConnection {
    server: ServerRef,
    fd: ConnectionId,
    reactor_id: usize,
}

impl TcpConnection {
    /// Creates a new `TcpConnection` bound to the given server handle.
    pub fn new(server: ServerRef, fd: ConnectionId, reactor_id: usize) -> Self {
        Self { server, fd, reactor_id }
    }

    /// Returns the connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.fd
    }

    /// Returns the reactor the connection belongs to.
    pub fn reactor_id(&self) -> usize {
        self.reactor_id
    }

    /// Returns `true` if the connection is still open.
    pub fn is_open(&self) -> bool {
        self.server.exists(self.fd)
    }

    /// Writes `data` to the peer.
    ///
    /// # Errors
    ///
    /// If the connection is gone, an error is returned.
    pub fn send<B: Into<Bytes>>(&self, data: B) -> Result<(), GenericError> {
        self.server.send(self.fd, data.into())
    }

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// If the connection is gone, an error is returned.
    pub fn close(&self) -> Result<(), GenericError> {
        self.server.close(self.fd)
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("fd", &self.fd)
            .field("reactor_id", &self.reactor_id)
            .finish()
    }
}

/// The application that owns business logic.
///
/// One instance exists per process. Handlers may run concurrently within a process when dispatch runs in concurrent
/// mode.
#[async_trait]
pub trait Application: Send + Sync {
    /// Prepares request-scoped state for a connection event.
    async fn before_initialize(&self, _connection: &TcpConnection) -> Result<(), GenericError> {
        Ok(())
    }

    /// Handles a new connection.
    async fn run_connect(&self, connection: &TcpConnection) -> Result<(), GenericError>;

    /// Handles data received on a connection.
    async fn run_receive(&self, connection: &TcpConnection, data: Bytes) -> Result<(), GenericError>;

    /// Handles a closed connection.
    async fn run_close(&self, connection: &TcpConnection) -> Result<(), GenericError>;

    /// Releases request-scoped and process-scoped component state.
    ///
    /// Called exactly once after every dispatch.
    fn clean_components(&self) -> Result<(), GenericError>;
}

/// Builds the application for a process.
pub trait ApplicationFactory: Send + Sync {
    /// Creates the application from its configuration file.
    ///
    /// # Errors
    ///
    /// If the application cannot be created, an error is returned.
    fn create(&self, config_file: &Path) -> Result<Arc<dyn Application>, GenericError>;
}

impl<F> ApplicationFactory for F
where
    F: Fn(&Path) -> Result<Arc<dyn Application>, GenericError> + Send + Sync,
{
    fn create(&self, config_file: &Path) -> Result<Arc<dyn Application>, GenericError> {
        self(config_file)
    }
}

/// Sink for errors caught at the dispatch boundary.
pub trait ErrorReporter: Send + Sync {
    /// Handles an error.
    fn handle_exception(&self, error: &GenericError);
}

/// An [`ErrorReporter`] that logs errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn handle_exception(&self, error: &GenericError) {
        error!(error = %format_args!("{:#}", error), "Error caught during dispatch.");
    }
}

/// Sets the title of the current process.
pub trait ProcessNamer: Send + Sync {
    /// Sets the process title.
    fn set_process_title(&self, title: &str);
}

/// A [`ProcessNamer`] that only records the title in the logs.
///
/// Roles run as threads inside one OS process, so there is no process-wide title to change.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogProcessNamer;

impl ProcessNamer for LogProcessNamer {
    fn set_process_title(&self, title: &str) {
        info!(title, "Process role assigned.");
    }
}
