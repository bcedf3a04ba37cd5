//! Worker processes.

use std::{
    future::pending,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use tcpd_core::{EngineEvent, EngineSettings, EventHandler, ProcessRole, ServerRef};
use tokio::{
    select,
    sync::{mpsc, oneshot, Notify},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{dispatch_and_wait, serve_connection, ConnectionRegistry},
    router::{Accepted, Router},
    runtime::{single_threaded, spawn_thread, EngineError},
};

/// Time given to the runtime of a stopped worker to wind down leftover tasks.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a worker is asked to stop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StopRequest {
    /// Whether in-flight connections may finish on their own before they are closed.
    pub drain: bool,

    /// Maximum time to wait for connections to finish.
    pub grace: Duration,
}

impl StopRequest {
    /// Closes connections right away, then waits for them to finish closing.
    pub fn immediate(grace: Duration) -> Self {
        Self { drain: false, grace }
    }

    /// Lets connections finish on their own, closing whatever is left once `grace` has elapsed.
    pub fn draining(grace: Duration) -> Self {
        Self { drain: true, grace }
    }
}

/// Counts the requests a worker has served against `max_request`.
///
/// A request is one Receive dispatch. A limit of zero never runs out.
pub(crate) struct RequestBudget {
    limit: usize,
    served: AtomicUsize,
    exhausted: Notify,
}

impl RequestBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            served: AtomicUsize::new(0),
            exhausted: Notify::new(),
        }
    }

    /// Records one served request.
    pub fn record(&self) {
        let served = self.served.fetch_add(1, Relaxed) + 1;
        if served == self.limit {
            // Stores a permit if nobody is waiting yet.
            self.exhausted.notify_one();
        }
    }

    pub fn served(&self) -> usize {
        self.served.load(Relaxed)
    }

    /// Resolves once `limit` requests have been recorded.
    pub async fn exhausted(&self) {
        if self.limit == 0 {
            pending::<()>().await
        } else {
            self.exhausted.notified().await
        }
    }
}

/// Notifications sent from workers to the manager.
#[derive(Debug)]
pub(crate) enum WorkerNotice {
    /// The worker reached `max_request` and should be replaced.
    ///
    /// It keeps taking connections until the replacement's inbox takes over its router slot.
    Retiring { worker_id: usize, generation: u64 },

    /// The worker thread finished.
    Exited { worker_id: usize, generation: u64 },
}

/// Everything a worker needs, shared by every worker the manager starts.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub handler: Arc<dyn EventHandler>,
    pub settings: EngineSettings,
    pub router: Arc<Router>,
    pub notices: mpsc::UnboundedSender<WorkerNotice>,
}

/// Handle to a running worker thread.
pub(crate) struct WorkerHandle {
    worker_id: usize,
    generation: u64,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Asks the worker to stop. Subsequent calls do nothing.
    pub fn stop(&mut self, request: StopRequest) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(request);
        }
    }

    /// Waits for the worker thread to finish.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker_id = self.worker_id, "Worker thread panicked.");
            }
        }
    }
}

/// Starts a worker on a dedicated thread with its own single-threaded runtime.
pub(crate) fn spawn_worker(context: WorkerContext, worker_id: usize, generation: u64) -> Result<WorkerHandle, EngineError> {
    let (stop_tx, stop_rx) = oneshot::channel();
    let role = ProcessRole::classify(worker_id, context.settings.worker_num);
    let thread_name = match role {
        ProcessRole::TaskWorker(_) => format!("tcpd-task-{:02}", worker_id),
        _ => format!("tcpd-worker-{:02}", worker_id),
    };

    // The inbox is registered before the thread starts, so connections routed while the worker boots queue up
    // instead of being dropped.
    let inbox_rx = if matches!(role, ProcessRole::Worker(_)) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        context.router.register(worker_id, generation, inbox_tx);
        Some(inbox_rx)
    } else {
        None
    };

    let router = Arc::clone(&context.router);
    let spawned = spawn_thread(thread_name, move || {
        let notices = context.notices.clone();
        match single_threaded(&role.to_string()) {
            Ok(runtime) => {
                runtime.block_on(run_worker(context, worker_id, generation, inbox_rx, stop_rx));
                runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            }
            Err(e) => warn!(worker_id, error = %e, "Failed to start worker."),
        }

        let _ = notices.send(WorkerNotice::Exited { worker_id, generation });
    });

    let thread = match spawned {
        Ok(thread) => thread,
        Err(e) => {
            router.unregister(worker_id, generation);
            return Err(e);
        }
    };

    Ok(WorkerHandle {
        worker_id,
        generation,
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    })
}

async fn run_worker(
    context: WorkerContext, worker_id: usize, generation: u64, mut inbox_rx: Option<mpsc::UnboundedReceiver<Accepted>>,
    mut stop_rx: oneshot::Receiver<StopRequest>,
) {
    let process = context.handler.fork();
    let registry = Arc::new(ConnectionRegistry::default());
    let server: ServerRef = registry.clone();
    let role = ProcessRole::classify(worker_id, context.settings.worker_num);

    // Runs from the root future of the runtime, outside any task.
    dispatch_and_wait(process.as_ref(), server.clone(), EngineEvent::WorkerStart { worker_id }).await;
    info!(%role, generation, "Worker started.");

    let cancel = CancellationToken::new();
    let mut connections = JoinSet::new();
    let budget = Arc::new(RequestBudget::new(context.settings.max_request));
    let mut retiring = false;

    let request = loop {
        select! {
            request = &mut stop_rx => break request.unwrap_or(StopRequest::immediate(RUNTIME_SHUTDOWN_TIMEOUT)),
            _ = budget.exhausted(), if !retiring => {
                info!(%role, served = budget.served(), "Worker reached max_request. Retiring.");
                let _ = context.notices.send(WorkerNotice::Retiring { worker_id, generation });
                retiring = true;
            },
            accepted = next_connection(&mut inbox_rx) => match accepted {
                Some(accepted) => {
                    connections.spawn(serve_connection(
                        Arc::clone(&process),
                        Arc::clone(&registry),
                        Arc::clone(&budget),
                        accepted,
                        cancel.child_token(),
                    ));
                }
                // The inbox closes once a newer generation replaced it in the router.
                None => {
                    inbox_rx = None;
                    if retiring {
                        debug!(%role, "Replacement worker took over. Draining connections.");
                        break StopRequest::draining(context.settings.max_wait_time);
                    }
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {},
        }
    };

    context.router.unregister(worker_id, generation);
    if let Some(mut inbox_rx) = inbox_rx.take() {
        inbox_rx.close();

        // Connections already handed to a draining worker are still served.
        while let Ok(accepted) = inbox_rx.try_recv() {
            if request.drain {
                connections.spawn(serve_connection(
                    Arc::clone(&process),
                    Arc::clone(&registry),
                    Arc::clone(&budget),
                    accepted,
                    cancel.child_token(),
                ));
            }
        }
    }

    drain_connections(&mut connections, &cancel, request).await;

    dispatch_and_wait(process.as_ref(), server, EngineEvent::WorkerStop { worker_id }).await;
    debug!(%role, generation, "Worker stopped.");
}

async fn next_connection(inbox_rx: &mut Option<mpsc::UnboundedReceiver<Accepted>>) -> Option<Accepted> {
    match inbox_rx {
        Some(inbox_rx) => inbox_rx.recv().await,
        None => pending().await,
    }
}

async fn drain_connections(connections: &mut JoinSet<()>, cancel: &CancellationToken, request: StopRequest) {
    if request.drain && !connections.is_empty() {
        debug!(open = connections.len(), grace = ?request.grace, "Waiting for connections to finish.");
        if wait_all(connections, request.grace).await {
            return;
        }
    }

    // Closing is cooperative: every connection still dispatches its Close event.
    cancel.cancel();
    if !wait_all(connections, request.grace).await {
        warn!(open = connections.len(), "Connections did not close in time. Aborting them.");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

async fn wait_all(connections: &mut JoinSet<()>, timeout: Duration) -> bool {
    let all_done = async { while connections.join_next().await.is_some() {} };
    tokio::time::timeout(timeout, all_done).await.is_ok()
}
