use std::{
    fs,
    net::SocketAddr,
    path::Path,
    sync::Arc,
    thread::JoinHandle,
};

use snafu::{OptionExt as _, ResultExt as _};
use tcpd_core::{ConnectionId, Engine, EngineEvent, EngineSettings, EventHandler, ProcessShutdown, ServerRef};
use tokio::{net::TcpListener, select, sync::oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{dispatch_and_wait, ConnectionRegistry},
    manager::spawn_manager,
    router::{Accepted, Router},
    runtime::{multi_threaded, EngineError, FailedToBind, Unbound},
};

/// An engine that runs every role in-process.
///
/// The master runs on the calling thread, backed by a multi-threaded runtime with `reactor_num` threads, and accepts
/// connections. The manager and every worker run on their own threads, each with a single-threaded runtime.
/// Connections are handed from the master to the worker chosen by their id.
pub struct LocalEngine {
    host: String,
    port: u16,
    settings: EngineSettings,
    handler: Option<Arc<dyn EventHandler>>,
    local_addr_tx: Option<oneshot::Sender<SocketAddr>>,
}

impl LocalEngine {
    /// Creates a new `LocalEngine` that listens on the given address.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            settings: EngineSettings::default(),
            handler: None,
            local_addr_tx: None,
        }
    }

    /// Returns a receiver that resolves to the bound address once the engine is listening.
    ///
    /// This is mostly useful when listening on port 0.
    pub fn local_addr(&mut self) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.local_addr_tx = Some(tx);
        rx
    }

    fn run(self, shutdown: ProcessShutdown) -> Result<bool, EngineError> {
        let handler = self.handler.clone().context(Unbound)?;
        let runtime = multi_threaded("tcpd-reactor", self.settings.reactor_num)?;

        let manager = runtime.block_on(self.run_master(handler, shutdown))?;
        let healthy = match manager.join() {
            Ok(healthy) => healthy,
            Err(_) => {
                error!("Manager thread panicked.");
                false
            }
        };

        Ok(healthy)
    }

    async fn run_master(
        self, handler: Arc<dyn EventHandler>, mut shutdown: ProcessShutdown,
    ) -> Result<JoinHandle<bool>, EngineError> {
        let address = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&address)
            .await
            .context(FailedToBind { address: address.clone() })?;
        let local_addr = listener.local_addr().context(FailedToBind { address })?;
        write_pid_file(&self.settings.pid_file);
        if let Some(tx) = self.local_addr_tx {
            let _ = tx.send(local_addr);
        }

        let master = handler.fork();
        let server: ServerRef = Arc::new(ConnectionRegistry::default());
        dispatch_and_wait(master.as_ref(), server, EngineEvent::Start).await;

        let router = Arc::new(Router::new(self.settings.worker_num));
        let (manager_shutdown, manager_shutdown_handle) = shutdown.child();
        let (ready_tx, ready_rx) = oneshot::channel();
        let manager = spawn_manager(
            handler,
            self.settings.clone(),
            Arc::clone(&router),
            manager_shutdown,
            ready_tx,
        )?;

        // Connections are only taken once every worker has an inbox.
        if !ready_rx.await.unwrap_or(false) {
            error!("Manager failed to start workers. Not accepting connections.");
            manager_shutdown_handle.trigger();
            remove_pid_file(&self.settings.pid_file);
            return Ok(manager);
        }

        info!(%local_addr, "Listening for connections.");

        let mut next_fd = 0u64;
        loop {
            select! {
                _ = shutdown.wait_for_shutdown() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if self.settings.open_tcp_nodelay {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(%peer_addr, error = %e, "Failed to set TCP_NODELAY.");
                            }
                        }

                        let stream = match stream.into_std() {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(%peer_addr, error = %e, "Failed to detach accepted connection.");
                                continue;
                            }
                        };

                        next_fd += 1;
                        let fd = ConnectionId::new(next_fd);
                        let reactor_id = (next_fd % self.settings.reactor_num as u64) as usize;
                        match router.route(Accepted { fd, reactor_id, stream }) {
                            Ok(worker_id) => debug!(%fd, %peer_addr, reactor_id, worker_id, "Accepted connection."),
                            Err(_) => warn!(%fd, %peer_addr, "No worker available for connection. Dropping it."),
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection."),
                },
            }
        }

        drop(listener);
        manager_shutdown_handle.trigger();
        remove_pid_file(&self.settings.pid_file);
        info!("Master stopped accepting connections.");

        Ok(manager)
    }
}

impl Engine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    fn configure(&mut self, settings: EngineSettings) {
        self.settings = settings;
    }

    fn bind(&mut self, handler: Arc<dyn EventHandler>) {
        self.handler = Some(handler);
    }

    fn start(self: Box<Self>, shutdown: ProcessShutdown) -> bool {
        match (*self).run(shutdown) {
            Ok(healthy) => healthy,
            Err(e) => {
                error!(error = %e, "Engine failed.");
                false
            }
        }
    }
}

fn write_pid_file(path: &Path) {
    if let Err(e) = fs::write(path, format!("{}\n", std::process::id())) {
        warn!(path = %path.display(), error = %e, "Failed to write PID file.");
    }
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Failed to remove PID file.");
    }
}
