//! Execution context bridge.
//!
//! Every event is handled inside exactly one task boundary. When concurrent mode is enabled and the caller is not
//! already running inside a task (for example, a runtime's root future), the work is handed off to a freshly spawned
//! task and the caller gets back a handle to it. Otherwise the work runs in place.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
};

use futures::future::{BoxFuture, FutureExt as _};
use tcpd_error::{generic_error, GenericError};
use tokio::task::JoinHandle;
use tracing::{debug_span, warn, Instrument as _};

use crate::event::{DispatchOutcome, EventKind};

static GLOBAL_CONTEXT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

tokio::task_local! {
    static CURRENT_CONTEXT: ExecutionContext;
}

/// Where a dispatch ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// The work ran in place, on the caller.
    Direct,

    /// The work was handed off to a newly spawned task.
    Bridged,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Bridged => f.write_str("bridged"),
        }
    }
}

/// Handle to the unit of work running a single dispatch.
///
/// A fresh context is created for every dispatch and is current only while that dispatch runs.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    id: u64,
    kind: EventKind,
    placement: Placement,
}

impl ExecutionContext {
    fn new(kind: EventKind, placement: Placement) -> Self {
        Self {
            id: GLOBAL_CONTEXT_ID_COUNTER.fetch_add(1, Relaxed),
            kind,
            placement,
        }
    }

    /// Returns the context for the dispatch currently running, if any.
    pub fn current() -> Option<Self> {
        CURRENT_CONTEXT.try_with(Clone::clone).ok()
    }

    /// Returns the unique identifier of this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the kind of event being dispatched.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns where the dispatch runs.
    pub fn placement(&self) -> Placement {
        self.placement
    }

    async fn run<F: Future>(self, work: F) -> F::Output {
        let span = debug_span!(
            "dispatch",
            context_id = self.id,
            event = %self.kind,
            placement = %self.placement,
        );

        CURRENT_CONTEXT.scope(self, work).instrument(span).await
    }
}

/// Scheduling capabilities needed by the bridge.
pub trait Scheduler: Send + Sync {
    /// Returns `true` if the caller is already running inside a task.
    fn is_inside_task(&self) -> bool;

    /// Returns `true` if the caller is able to spawn a task.
    fn can_spawn(&self) -> bool;

    /// Spawns `work` as a new task.
    ///
    /// # Errors
    ///
    /// If the task cannot be spawned, an error is returned.
    fn spawn(&self, work: BoxFuture<'static, DispatchOutcome>) -> Result<JoinHandle<DispatchOutcome>, GenericError>;
}

/// A [`Scheduler`] backed by the ambient Tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn is_inside_task(&self) -> bool {
        tokio::task::try_id().is_some()
    }

    fn can_spawn(&self) -> bool {
        tokio::runtime::Handle::try_current().is_ok()
    }

    fn spawn(&self, work: BoxFuture<'static, DispatchOutcome>) -> Result<JoinHandle<DispatchOutcome>, GenericError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| generic_error!("No runtime available to spawn dispatch task: {}", e))?;
        Ok(handle.spawn(work))
    }
}

/// Result of handing an event to the bridge.
#[derive(Debug)]
pub enum Dispatch {
    /// The work ran in place and has completed.
    Direct(DispatchOutcome),

    /// The work was handed off to a spawned task.
    Bridged(JoinHandle<DispatchOutcome>),
}

impl Dispatch {
    /// Returns where the dispatch ran.
    pub fn placement(&self) -> Placement {
        match self {
            Self::Direct(_) => Placement::Direct,
            Self::Bridged(_) => Placement::Bridged,
        }
    }

    /// Waits for the dispatch to complete and returns its outcome.
    ///
    /// A spawned task that panicked or was aborted yields [`DispatchOutcome::FatalError`].
    pub async fn outcome(self) -> DispatchOutcome {
        match self {
            Self::Direct(outcome) => outcome,
            Self::Bridged(handle) => match handle.await {
                Ok(outcome) => outcome,
                Err(e) => DispatchOutcome::FatalError(generic_error!("Dispatch task did not complete: {}", e)),
            },
        }
    }
}

/// Runs each dispatch inside exactly one task boundary.
#[derive(Clone)]
pub struct Bridge {
    scheduler: Arc<dyn Scheduler>,
    concurrent: bool,
}

impl Bridge {
    /// Creates a new `Bridge`.
    ///
    /// When `concurrent` is `false`, every dispatch runs in place.
    pub fn new(scheduler: Arc<dyn Scheduler>, concurrent: bool) -> Self {
        Self { scheduler, concurrent }
    }

    /// Dispatches `work` for an event of the given kind.
    ///
    /// In concurrent mode, when the caller is not inside a task, `work` is spawned once and this returns without
    /// waiting for it. In every other case `work` is awaited in place.
    pub async fn dispatch<F>(&self, kind: EventKind, work: F) -> Dispatch
    where
        F: Future<Output = DispatchOutcome> + Send + 'static,
    {
        if self.concurrent && !self.scheduler.is_inside_task() {
            if self.scheduler.can_spawn() {
                let context = ExecutionContext::new(kind, Placement::Bridged);
                return match self.scheduler.spawn(context.run(work).boxed()) {
                    Ok(handle) => Dispatch::Bridged(handle),
                    Err(e) => Dispatch::Direct(DispatchOutcome::FatalError(e)),
                };
            }

            warn!(event = %kind, "No runtime available to spawn dispatch task. Running in place.");
        }

        let context = ExecutionContext::new(kind, Placement::Direct);
        Dispatch::Direct(context.run(work).await)
    }
}
