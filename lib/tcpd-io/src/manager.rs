//! The manager process: starts, recycles, reloads, and stops workers.

use std::{future::pending, sync::Arc, thread::JoinHandle, time::Duration};

use tcpd_core::{EngineEvent, EngineSettings, EventHandler, ProcessShutdown, ServerRef};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{dispatch_and_wait, ConnectionRegistry},
    router::Router,
    runtime::{single_threaded, spawn_thread, EngineError},
    worker::{spawn_worker, StopRequest, WorkerContext, WorkerHandle, WorkerNotice},
};

/// Extra time, beyond the grace period, that workers get to report that they exited.
const EXIT_REPORT_SLACK: Duration = Duration::from_secs(2);

/// Starts the manager on a dedicated thread.
///
/// `ready` receives whether every worker started. The returned thread resolves to `true` if every worker started and
/// the manager stopped cleanly.
pub(crate) fn spawn_manager(
    handler: Arc<dyn EventHandler>, settings: EngineSettings, router: Arc<Router>, shutdown: ProcessShutdown,
    ready: oneshot::Sender<bool>,
) -> Result<JoinHandle<bool>, EngineError> {
    spawn_thread("tcpd-manager".to_string(), move || match single_threaded("manager") {
        Ok(runtime) => runtime.block_on(run_manager(handler, settings, router, shutdown, ready)),
        Err(e) => {
            error!(error = %e, "Failed to start manager.");
            false
        }
    })
}

async fn run_manager(
    handler: Arc<dyn EventHandler>, settings: EngineSettings, router: Arc<Router>, mut shutdown: ProcessShutdown,
    ready: oneshot::Sender<bool>,
) -> bool {
    let process = handler.fork();
    let server: ServerRef = Arc::new(ConnectionRegistry::default());
    dispatch_and_wait(process.as_ref(), server.clone(), EngineEvent::ManagerStart).await;

    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
    let mut pool = WorkerPool::new(WorkerContext {
        handler,
        settings: settings.clone(),
        router,
        notices: notices_tx,
    });

    let healthy = pool.start_all();
    let _ = ready.send(healthy);
    if healthy {
        info!(
            workers = settings.worker_num,
            task_workers = settings.task_worker_num,
            "Manager started."
        );

        let mut reload = ReloadSignal::new();
        loop {
            select! {
                _ = shutdown.wait_for_shutdown() => break,
                Some(notice) = notices_rx.recv() => pool.handle_notice(notice),
                _ = reload.recv() => {
                    let request = if settings.reload_async {
                        StopRequest::draining(settings.max_wait_time)
                    } else {
                        StopRequest::immediate(settings.max_wait_time)
                    };
                    info!(reload_async = settings.reload_async, "Reloading workers.");
                    pool.reload(request);
                },
            }
        }
    }

    pool.stop_all(StopRequest::immediate(settings.max_wait_time), &mut notices_rx)
        .await;

    dispatch_and_wait(process.as_ref(), server, EngineEvent::ManagerStop).await;
    debug!("Manager stopped.");

    healthy
}

/// The workers owned by the manager.
struct WorkerPool {
    context: WorkerContext,
    current: Vec<Option<WorkerHandle>>,
    retired: Vec<WorkerHandle>,
    next_generation: u64,
}

impl WorkerPool {
    fn new(context: WorkerContext) -> Self {
        let total = context.settings.total_workers();
        Self {
            context,
            current: (0..total).map(|_| None).collect(),
            retired: Vec::new(),
            next_generation: 0,
        }
    }

    fn start_all(&mut self) -> bool {
        (0..self.current.len()).all(|worker_id| self.start(worker_id))
    }

    fn start(&mut self, worker_id: usize) -> bool {
        self.next_generation += 1;
        match spawn_worker(self.context.clone(), worker_id, self.next_generation) {
            Ok(handle) => {
                self.current[worker_id] = Some(handle);
                true
            }
            Err(e) => {
                error!(worker_id, error = %e, "Failed to start worker.");
                false
            }
        }
    }

    fn handle_notice(&mut self, notice: WorkerNotice) {
        match notice {
            WorkerNotice::Retiring { worker_id, generation } => {
                if self.is_current(worker_id, generation) {
                    if let Some(handle) = self.current[worker_id].take() {
                        self.retired.push(handle);
                    }
                    self.start(worker_id);
                }
            }
            WorkerNotice::Exited { worker_id, generation } => {
                if let Some(index) = self
                    .retired
                    .iter()
                    .position(|h| h.worker_id() == worker_id && h.generation() == generation)
                {
                    self.retired.swap_remove(index).join();
                } else if self.is_current(worker_id, generation) {
                    warn!(worker_id, "Worker exited unexpectedly. Restarting.");
                    if let Some(handle) = self.current[worker_id].take() {
                        handle.join();
                    }
                    self.start(worker_id);
                }
            }
        }
    }

    fn reload(&mut self, request: StopRequest) {
        for worker_id in 0..self.current.len() {
            if let Some(mut handle) = self.current[worker_id].take() {
                handle.stop(request);
                self.retired.push(handle);
            }
            self.start(worker_id);
        }
    }

    async fn stop_all(&mut self, request: StopRequest, notices_rx: &mut mpsc::UnboundedReceiver<WorkerNotice>) {
        self.retired.extend(self.current.iter_mut().filter_map(Option::take));
        for handle in &mut self.retired {
            handle.stop(request);
        }

        let deadline = Instant::now() + request.grace + EXIT_REPORT_SLACK;
        while !self.retired.is_empty() {
            match tokio::time::timeout_at(deadline, notices_rx.recv()).await {
                Ok(Some(WorkerNotice::Exited { worker_id, generation })) => {
                    if let Some(index) = self
                        .retired
                        .iter()
                        .position(|h| h.worker_id() == worker_id && h.generation() == generation)
                    {
                        self.retired.swap_remove(index).join();
                    }
                }
                Ok(Some(WorkerNotice::Retiring { .. })) => {}
                Ok(None) | Err(_) => {
                    warn!(remaining = self.retired.len(), "Workers did not stop in time. Detaching them.");
                    self.retired.clear();
                }
            }
        }
    }

    fn is_current(&self, worker_id: usize, generation: u64) -> bool {
        self.current
            .get(worker_id)
            .and_then(Option::as_ref)
            .is_some_and(|h| h.generation() == generation)
    }
}

/// Reload requests delivered through `SIGUSR1`.
struct ReloadSignal {
    #[cfg(unix)]
    inner: Option<tokio::signal::unix::Signal>,
}

impl ReloadSignal {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let inner = match signal(SignalKind::user_defined1()) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    warn!(error = %e, "Failed to install reload signal handler. Reloading is disabled.");
                    None
                }
            };
            Self { inner }
        }

        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(signal) = self.inner.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
        }

        pending::<()>().await
    }
}
