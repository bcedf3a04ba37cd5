//! Per-connection serving.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::{Bytes, BytesMut};
use tcpd_core::{ConnectionId, DispatchOutcome, EngineEvent, EventHandler, ServerHandle, ServerRef};
use tcpd_error::{generic_error, GenericError};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{router::Accepted, worker::RequestBudget};

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug)]
enum Outbound {
    Data(Bytes),
    Close,
}

/// Open connections of a single worker.
///
/// This is the [`ServerHandle`] handed to every event a worker dispatches: writes and close requests are queued to the
/// task that owns the connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>>,
}

impl ConnectionRegistry {
    /// Returns the number of open connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if there are no open connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn insert(&self, fd: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) {
        self.lock().insert(fd, tx);
    }

    fn remove(&self, fd: ConnectionId) {
        self.lock().remove(&fd);
    }

    fn queue(&self, fd: ConnectionId, message: Outbound) -> Result<(), GenericError> {
        let connections = self.lock();
        let tx = connections
            .get(&fd)
            .ok_or_else(|| generic_error!("Unknown connection {}.", fd))?;
        tx.send(message)
            .map_err(|_| generic_error!("Connection {} is closing.", fd))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ServerHandle for ConnectionRegistry {
    fn send(&self, fd: ConnectionId, data: Bytes) -> Result<(), GenericError> {
        self.queue(fd, Outbound::Data(data))
    }

    fn close(&self, fd: ConnectionId) -> Result<(), GenericError> {
        self.queue(fd, Outbound::Close)
    }

    fn exists(&self, fd: ConnectionId) -> bool {
        self.lock().get(&fd).is_some_and(|tx| !tx.is_closed())
    }
}

/// Dispatches an event and waits for its outcome, logging failures.
pub(crate) async fn dispatch_and_wait(handler: &dyn EventHandler, server: ServerRef, event: EngineEvent) -> bool {
    let kind = event.kind();
    match handler.dispatch(server, event).await.outcome().await {
        DispatchOutcome::Success => true,
        DispatchOutcome::ApplicationError(e) => {
            debug!(event = %kind, error = %format_args!("{:#}", e), "Dispatch failed with an application error.");
            false
        }
        DispatchOutcome::FatalError(e) => {
            warn!(event = %kind, error = %format_args!("{:#}", e), "Dispatch failed with a fatal error.");
            false
        }
    }
}

/// Serves a single connection until the peer closes it, the application closes it, or `cancel` fires.
///
/// Connect, every Receive, and Close are dispatched in order from this task, and Close is always the last event. Each
/// Receive dispatch is recorded against `budget`.
pub(crate) async fn serve_connection(
    handler: Arc<dyn EventHandler>, registry: Arc<ConnectionRegistry>, budget: Arc<RequestBudget>, accepted: Accepted,
    cancel: CancellationToken,
) {
    let Accepted { fd, reactor_id, stream } = accepted;
    let stream = match TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%fd, error = %e, "Failed to register accepted connection with worker runtime.");
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    registry.insert(fd, outbound_tx);
    let server: ServerRef = registry.clone();

    dispatch_and_wait(handler.as_ref(), server.clone(), EngineEvent::Connect { fd, reactor_id }).await;

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        buf.reserve(READ_BUFFER_SIZE);

        select! {
            _ = cancel.cancelled() => {
                debug!(%fd, "Closing connection for worker shutdown.");
                break;
            },
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    let data = buf.split().freeze();
                    let event = EngineEvent::Receive { fd, reactor_id, data };
                    dispatch_and_wait(handler.as_ref(), server.clone(), event).await;
                    budget.record();
                }
                Err(e) => {
                    debug!(%fd, error = %e, "Failed to read from connection.");
                    break;
                }
            },
            message = outbound_rx.recv() => match message {
                Some(Outbound::Data(data)) => {
                    if let Err(e) = writer.write_all(&data).await {
                        debug!(%fd, error = %e, "Failed to write to connection.");
                        break;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
        }
    }

    // Flush whatever the application queued before the connection went away.
    registry.remove(fd);
    while let Ok(message) = outbound_rx.try_recv() {
        match message {
            Outbound::Data(data) => {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;

    dispatch_and_wait(handler.as_ref(), server, EngineEvent::Close { fd, reactor_id }).await;
}
