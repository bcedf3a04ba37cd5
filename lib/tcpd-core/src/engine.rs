//! Host engine interface.
//!
//! The engine owns sockets, the accept loop, and the processes (master, manager, workers) that events are delivered
//! in. It drives a bound [`EventHandler`] with [`EngineEvent`]s and exposes a [`ServerHandle`] that handlers use to
//! write back to connections.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tcpd_error::GenericError;

use crate::{
    bridge::Dispatch,
    event::{ConnectionId, EngineEvent},
    settings::EngineSettings,
    shutdown::ProcessShutdown,
};

/// Engine-side view of the server, scoped to the process it is handed to.
pub trait ServerHandle: Send + Sync {
    /// Queues `data` to be written to the given connection.
    ///
    /// # Errors
    ///
    /// If the connection does not exist, or is already closing, an error is returned.
    fn send(&self, fd: ConnectionId, data: Bytes) -> Result<(), GenericError>;

    /// Asks the engine to close the given connection.
    ///
    /// # Errors
    ///
    /// If the connection does not exist, an error is returned.
    fn close(&self, fd: ConnectionId) -> Result<(), GenericError>;

    /// Returns `true` if the given connection is still open.
    fn exists(&self, fd: ConnectionId) -> bool;
}

/// Shared reference to a [`ServerHandle`].
pub type ServerRef = Arc<dyn ServerHandle>;

/// Receiver of engine events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Dispatches a single event.
    ///
    /// The returned [`Dispatch`] is either already complete, or a handle to the task the event was handed off to.
    async fn dispatch(&self, server: ServerRef, event: EngineEvent) -> Dispatch;

    /// Creates a handler for a newly started process.
    ///
    /// The new handler shares configuration with this one but starts with no role assigned. Engines call this once
    /// for every process they start, including replacements for recycled workers.
    fn fork(&self) -> Arc<dyn EventHandler>;
}

/// A host networking engine.
pub trait Engine: Send {
    /// Returns the name of the engine.
    fn name(&self) -> &str;

    /// Applies the resolved server settings.
    fn configure(&mut self, settings: EngineSettings);

    /// Binds the handler that receives every event.
    fn bind(&mut self, handler: Arc<dyn EventHandler>);

    /// Runs the engine until `shutdown` resolves or the engine fails.
    ///
    /// Returns `true` if the engine ran and stopped cleanly.
    fn start(self: Box<Self>, shutdown: ProcessShutdown) -> bool;
}
