//! Event dispatcher.
//!
//! Routes engine events to role transitions, application handlers, and hooks. Every dispatch goes through the
//! [`Bridge`] and runs its body under [`run_with_cleanup`], so teardown happens exactly once and, in concurrent mode,
//! inside the task that ran the body.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tcpd_error::{generic_error, GenericError};
use tracing::debug;

use crate::{
    application::{ApplicationFactory, ErrorReporter, ProcessNamer, TcpConnection},
    bridge::{Bridge, Dispatch},
    callbacks::CallbackRegistry,
    engine::{EventHandler, ServerRef},
    event::{ConnectionId, DispatchOutcome, EngineEvent, EventKind},
    guard::run_with_cleanup,
    role::{ProcessRole, RoleInit, RoleState},
};

/// Configuration and collaborators shared by every process's dispatcher.
pub(crate) struct DispatcherContext {
    pub service: String,
    pub host: String,
    pub port: u16,
    pub config_file: PathBuf,
    pub worker_num: usize,
    pub bridge: Bridge,
    pub callbacks: CallbackRegistry,
    pub factory: Arc<dyn ApplicationFactory>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub namer: Arc<dyn ProcessNamer>,
}

impl DispatcherContext {
    fn report(&self, error: &GenericError) {
        self.reporter.handle_exception(error);
    }
}

/// Event dispatcher for a single process.
///
/// Dispatchers for other processes are created with [`EventHandler::fork`]: they share configuration but each has its
/// own role state.
pub struct Dispatcher {
    context: Arc<DispatcherContext>,
    roles: Arc<RoleState>,
}

impl Dispatcher {
    pub(crate) fn new(context: DispatcherContext) -> Self {
        Self {
            context: Arc::new(context),
            roles: Arc::new(RoleState::new()),
        }
    }

    /// Returns the role of this dispatcher's process, if one has been assigned.
    pub fn role(&self) -> Option<ProcessRole> {
        self.roles.role()
    }

    /// Handles the master process starting.
    pub async fn on_start(&self) -> Dispatch {
        self.lifecycle(EventKind::Start, Some(ProcessRole::Master)).await
    }

    /// Handles the manager process starting.
    pub async fn on_manager_start(&self) -> Dispatch {
        self.lifecycle(EventKind::ManagerStart, Some(ProcessRole::Manager)).await
    }

    /// Handles the manager process stopping.
    pub async fn on_manager_stop(&self) -> Dispatch {
        self.lifecycle(EventKind::ManagerStop, None).await
    }

    /// Handles a worker process starting.
    pub async fn on_worker_start(&self, worker_id: usize) -> Dispatch {
        let role = ProcessRole::classify(worker_id, self.context.worker_num);
        self.lifecycle(EventKind::WorkerStart, Some(role)).await
    }

    /// Handles a worker process stopping.
    pub async fn on_worker_stop(&self, worker_id: usize) -> Dispatch {
        debug!(worker_id, "Worker stopping.");
        self.lifecycle(EventKind::WorkerStop, None).await
    }

    /// Handles a new connection.
    pub async fn on_connect(&self, server: ServerRef, fd: ConnectionId, reactor_id: usize) -> Dispatch {
        self.connection(EventKind::Connect, TcpConnection::new(server, fd, reactor_id), None)
            .await
    }

    /// Handles data received on a connection.
    pub async fn on_receive(&self, server: ServerRef, fd: ConnectionId, reactor_id: usize, data: Bytes) -> Dispatch {
        self.connection(EventKind::Receive, TcpConnection::new(server, fd, reactor_id), Some(data))
            .await
    }

    /// Handles a closed connection.
    pub async fn on_close(&self, server: ServerRef, fd: ConnectionId, reactor_id: usize) -> Dispatch {
        self.connection(EventKind::Close, TcpConnection::new(server, fd, reactor_id), None)
            .await
    }

    /// Dispatches a lifecycle event.
    ///
    /// Start events enter `role` first. Stop events pass `None` and only run their hook. The master's start hook is
    /// fired by the server before the engine runs, so it is not fired here.
    async fn lifecycle(&self, kind: EventKind, role: Option<ProcessRole>) -> Dispatch {
        let context = Arc::clone(&self.context);
        let roles = Arc::clone(&self.roles);

        let work = async move {
            let body = async {
                if let Some(role) = role {
                    let init = RoleInit {
                        service: &context.service,
                        host: &context.host,
                        port: context.port,
                        config_file: &context.config_file,
                        factory: context.factory.as_ref(),
                        namer: context.namer.as_ref(),
                    };

                    if let Err(e) = roles.transition(role, init) {
                        let e = GenericError::from(e);
                        context.report(&e);
                        return DispatchOutcome::ApplicationError(e);
                    }

                    debug!(%role, "Process role entered.");
                }

                if kind == EventKind::Start {
                    return DispatchOutcome::Success;
                }

                match context.callbacks.notify(kind) {
                    Ok(()) => DispatchOutcome::Success,
                    Err(e) => {
                        context.report(&e);
                        DispatchOutcome::ApplicationError(e)
                    }
                }
            };

            run_with_cleanup(body, teardown(&roles), context.reporter.as_ref()).await
        };

        self.context.bridge.dispatch(kind, work).await
    }

    /// Dispatches a connection event.
    async fn connection(&self, kind: EventKind, connection: TcpConnection, data: Option<Bytes>) -> Dispatch {
        let context = Arc::clone(&self.context);
        let roles = Arc::clone(&self.roles);

        let work = async move {
            let body = async {
                let mut outcome = match run_handler(&roles, kind, &connection, data).await {
                    Ok(()) => DispatchOutcome::Success,
                    Err(e) => {
                        context.report(&e);
                        DispatchOutcome::ApplicationError(e)
                    }
                };

                if outcome.is_success() {
                    if let Err(e) = context.callbacks.notify_with(kind, true) {
                        context.report(&e);
                        outcome = DispatchOutcome::ApplicationError(e);
                    }
                }

                if !outcome.is_success() {
                    if let Err(e) = context.callbacks.notify_with(kind, false) {
                        context.report(&e);
                        outcome = DispatchOutcome::FatalError(e);
                    }
                }

                outcome
            };

            run_with_cleanup(body, teardown(&roles), context.reporter.as_ref()).await
        };

        self.context.bridge.dispatch(kind, work).await
    }
}

async fn run_handler(
    roles: &RoleState, kind: EventKind, connection: &TcpConnection, data: Option<Bytes>,
) -> Result<(), GenericError> {
    let application = roles
        .application()
        .ok_or_else(|| generic_error!("Application not initialized; dropping {} event.", kind))?;

    application.before_initialize(connection).await?;

    match kind {
        EventKind::Connect => application.run_connect(connection).await,
        EventKind::Receive => application.run_receive(connection, data.unwrap_or_default()).await,
        EventKind::Close => application.run_close(connection).await,
        _ => Err(generic_error!("'{}' is not a connection event.", kind)),
    }
}

fn teardown(roles: &Arc<RoleState>) -> impl FnOnce() -> Result<(), GenericError> + Send + 'static {
    let roles = Arc::clone(roles);
    move || match roles.application() {
        Some(application) => application.clean_components(),
        None => Ok(()),
    }
}

#[async_trait]
impl EventHandler for Dispatcher {
    async fn dispatch(&self, server: ServerRef, event: EngineEvent) -> Dispatch {
        match event {
            EngineEvent::Start => self.on_start().await,
            EngineEvent::ManagerStart => self.on_manager_start().await,
            EngineEvent::ManagerStop => self.on_manager_stop().await,
            EngineEvent::WorkerStart { worker_id } => self.on_worker_start(worker_id).await,
            EngineEvent::WorkerStop { worker_id } => self.on_worker_stop(worker_id).await,
            EngineEvent::Connect { fd, reactor_id } => self.on_connect(server, fd, reactor_id).await,
            EngineEvent::Receive { fd, reactor_id, data } => self.on_receive(server, fd, reactor_id, data).await,
            EngineEvent::Close { fd, reactor_id } => self.on_close(server, fd, reactor_id).await,
        }
    }

    fn fork(&self) -> Arc<dyn EventHandler> {
        Arc::new(Self {
            context: Arc::clone(&self.context),
            roles: Arc::new(RoleState::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Mutex,
        },
    };

    use super::*;
    use crate::{
        application::Application,
        bridge::{ExecutionContext, Placement},
        callbacks::Hook,
        test_util::{CountingScheduler, RecordingApplication, RecordingNamer, RecordingReporter, RecordingServer},
    };

    struct Harness {
        dispatcher: Dispatcher,
        #[allow(dead_code)]
        app: RecordingApplication,
        reporter: RecordingReporter,
        namer: RecordingNamer,
        scheduler: CountingScheduler,
        server: Arc<RecordingServer>,
    }

    impl Harness {
        fn new(concurrent: bool, app: RecordingApplication, callbacks: CallbackRegistry) -> Self {
            let reporter = RecordingReporter::default();
            let namer = RecordingNamer::default();
            let scheduler = CountingScheduler::default();

            let dispatcher = Dispatcher::new(DispatcherContext {
                service: "tcpd".to_string(),
                host: "127.0.0.1".to_string(),
                port: 9503,
                config_file: PathBuf::from("app.yaml"),
                worker_num: 2,
                bridge: Bridge::new(Arc::new(scheduler.clone()), concurrent),
                callbacks,
                factory: Arc::new(app.factory()),
                reporter: Arc::new(reporter.clone()),
                namer: Arc::new(namer.clone()),
            });

            Self {
                dispatcher,
                app,
                reporter,
                namer,
                scheduler,
                server: RecordingServer::shared(),
            }
        }

        fn server(&self) -> ServerRef {
            self.server.clone()
        }
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn flag_recorder(kind: EventKind) -> (CallbackRegistry, Arc<Mutex<Vec<bool>>>) {
        let flags = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&flags);

        let mut callbacks = CallbackRegistry::new();
        callbacks
            .register(
                kind,
                Hook::dispatch(move |success| {
                    recorder.lock().unwrap().push(success);
                    Ok(())
                }),
            )
            .unwrap();

        (callbacks, flags)
    }

    #[test]
    fn teardown_runs_once_for_every_event_kind() {
        for concurrent in [false, true] {
            let app = RecordingApplication::failing_on(EventKind::Receive);
            let h = Harness::new(concurrent, app.clone(), CallbackRegistry::new());
            let fd = ConnectionId::new(1);

            block_on(async {
                assert!(h.dispatcher.on_worker_start(0).await.outcome().await.is_success());
                assert_eq!(app.cleanups(), 1);

                let events = [
                    EngineEvent::Start,
                    EngineEvent::ManagerStart,
                    EngineEvent::ManagerStop,
                    EngineEvent::WorkerStart { worker_id: 1 },
                    EngineEvent::WorkerStop { worker_id: 0 },
                    EngineEvent::Connect { fd, reactor_id: 0 },
                    EngineEvent::Receive {
                        fd,
                        reactor_id: 0,
                        data: Bytes::from_static(b"ping"),
                    },
                    EngineEvent::Close { fd, reactor_id: 0 },
                ];

                for (i, event) in events.into_iter().enumerate() {
                    h.dispatcher.dispatch(h.server(), event).await.outcome().await;
                    assert_eq!(app.cleanups(), i + 2, "concurrent={}", concurrent);
                }
            });

            // Re-entering a role on a started worker, plus the failing receive handler.
            assert_eq!(h.reporter.errors().len(), 4);
            assert_eq!(h.dispatcher.role(), Some(ProcessRole::Worker(0)));
            assert_eq!(app.instances(), 1);
        }
    }

    #[test]
    fn connection_events_keep_their_order_within_a_task() {
        let app = RecordingApplication::default();
        let h = Arc::new(Harness::new(true, app.clone(), CallbackRegistry::new()));

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            h.dispatcher.on_worker_start(0).await.outcome().await;
            assert_eq!(h.scheduler.spawned(), 1);

            let task = tokio::spawn({
                let h = Arc::clone(&h);
                async move {
                    let fd = ConnectionId::new(7);
                    let mut placements = Vec::new();
                    for dispatch in [
                        h.dispatcher.on_connect(h.server(), fd, 3).await,
                        h.dispatcher
                            .on_receive(h.server(), fd, 3, Bytes::from_static(b"hello"))
                            .await,
                        h.dispatcher.on_close(h.server(), fd, 3).await,
                    ] {
                        placements.push(dispatch.placement());
                        assert!(dispatch.outcome().await.is_success());
                    }
                    placements
                }
            });

            let placements = task.await.unwrap();
            assert_eq!(placements, vec![Placement::Direct; 3]);
        });

        // Already inside a task, so nothing else was spawned.
        assert_eq!(h.scheduler.spawned(), 1);

        let events = app.events();
        let kinds = events.iter().map(|e| e.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EventKind::Connect, EventKind::Receive, EventKind::Close]);
        assert!(events.iter().all(|e| e.fd == ConnectionId::new(7)));
        assert_eq!(events[1].data.as_deref(), Some(&b"hello"[..]));
        assert_eq!(h.server.sent(), vec![(ConnectionId::new(7), Bytes::from_static(b"hello"))]);

        let ids = events
            .iter()
            .map(|e| e.context.as_ref().unwrap().id())
            .collect::<Vec<_>>();
        assert!(ids[0] != ids[1] && ids[1] != ids[2]);
    }

    #[test]
    fn concurrent_dispatch_outside_task_runs_in_one_spawned_task() {
        let app = RecordingApplication::default();
        let h = Harness::new(true, app.clone(), CallbackRegistry::new());

        block_on(async {
            h.dispatcher.on_worker_start(0).await.outcome().await;

            let dispatch = h
                .dispatcher
                .on_receive(h.server(), ConnectionId::new(1), 0, Bytes::from_static(b"x"))
                .await;
            assert_eq!(dispatch.placement(), Placement::Bridged);

            // Handed off, not run in place.
            assert!(app.events().is_empty());
            assert_eq!(app.cleanups(), 1);

            assert!(dispatch.outcome().await.is_success());
        });

        let events = app.events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].context.as_ref().map(ExecutionContext::placement),
            Some(Placement::Bridged)
        );
        assert_eq!(app.cleanups(), 2);
        assert_eq!(h.scheduler.spawned(), 2);
    }

    #[test]
    fn synchronous_mode_cleans_up_on_the_calling_thread() {
        let app = RecordingApplication::default();
        let h = Harness::new(false, app.clone(), CallbackRegistry::new());
        let fd = ConnectionId::new(2);

        block_on(async {
            for dispatch in [
                h.dispatcher.on_worker_start(1).await,
                h.dispatcher.on_connect(h.server(), fd, 0).await,
                h.dispatcher.on_receive(h.server(), fd, 0, Bytes::new()).await,
                h.dispatcher.on_close(h.server(), fd, 0).await,
                h.dispatcher.on_worker_stop(1).await,
            ] {
                assert_eq!(dispatch.placement(), Placement::Direct);
                assert!(dispatch.outcome().await.is_success());
            }
        });

        let caller = std::thread::current().id();
        assert_eq!(app.cleanup_threads(), vec![caller; 5]);
        assert_eq!(h.scheduler.spawned(), 0);
    }

    #[test]
    fn worker_indices_are_classified_by_worker_num() {
        let h = Harness::new(true, RecordingApplication::default(), CallbackRegistry::new());

        block_on(async {
            let task_worker = h.dispatcher.fork();
            let event = EngineEvent::WorkerStart { worker_id: 2 };
            task_worker.dispatch(h.server(), event).await.outcome().await;

            let worker = h.dispatcher.fork();
            let event = EngineEvent::WorkerStart { worker_id: 1 };
            worker.dispatch(h.server(), event).await.outcome().await;
        });

        assert_eq!(
            h.namer.titles(),
            vec!["tcpd: task #2".to_string(), "tcpd: worker #1".to_string()]
        );
        assert_eq!(h.dispatcher.role(), None);
    }

    #[test]
    fn failing_receive_reports_false_and_still_tears_down() {
        let app = RecordingApplication::failing_on(EventKind::Receive);
        let (callbacks, flags) = flag_recorder(EventKind::Receive);
        let h = Harness::new(true, app.clone(), callbacks);

        let outcome = block_on(async {
            h.dispatcher.on_worker_start(0).await.outcome().await;
            h.dispatcher
                .on_receive(h.server(), ConnectionId::new(4), 1, Bytes::from_static(b"bad"))
                .await
                .outcome()
                .await
        });

        assert!(matches!(outcome, DispatchOutcome::ApplicationError(_)));
        assert_eq!(*flags.lock().unwrap(), vec![false]);
        assert_eq!(app.cleanups(), 2);
        assert_eq!(h.reporter.errors(), vec!["receive handler failed".to_string()]);
    }

    #[test]
    fn manager_stop_outside_task_is_bridged_and_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let placement = Arc::new(Mutex::new(None));

        let mut callbacks = CallbackRegistry::new();
        callbacks
            .register_named("manager_stop_callback", {
                let calls = Arc::clone(&calls);
                let placement = Arc::clone(&placement);
                Hook::lifecycle(move || {
                    calls.fetch_add(1, SeqCst);
                    *placement.lock().unwrap() = ExecutionContext::current().map(|c| c.placement());
                    Ok(())
                })
            })
            .unwrap();

        let h = Harness::new(true, RecordingApplication::default(), callbacks);

        block_on(async {
            let dispatch = h.dispatcher.on_manager_stop().await;
            assert_eq!(dispatch.placement(), Placement::Bridged);
            assert_eq!(calls.load(SeqCst), 0);
            assert!(dispatch.outcome().await.is_success());
        });

        assert_eq!(calls.load(SeqCst), 1);
        assert_eq!(*placement.lock().unwrap(), Some(Placement::Bridged));
        assert_eq!(h.scheduler.spawned(), 1);
    }

    #[test]
    fn stop_events_run_stop_logic() {
        let stops = Arc::new(AtomicUsize::new(0));
        let starts = Arc::new(AtomicUsize::new(0));

        let mut callbacks = CallbackRegistry::new();
        callbacks
            .register(EventKind::WorkerStart, {
                let starts = Arc::clone(&starts);
                Hook::lifecycle(move || {
                    starts.fetch_add(1, SeqCst);
                    Ok(())
                })
            })
            .unwrap();
        callbacks
            .register(EventKind::WorkerStop, {
                let stops = Arc::clone(&stops);
                Hook::lifecycle(move || {
                    stops.fetch_add(1, SeqCst);
                    Ok(())
                })
            })
            .unwrap();

        let app = RecordingApplication::default();
        let h = Harness::new(true, app.clone(), callbacks);

        block_on(async {
            h.dispatcher.on_worker_start(0).await.outcome().await;
            h.dispatcher.on_worker_stop(0).await.outcome().await;
        });

        assert_eq!(starts.load(SeqCst), 1);
        assert_eq!(stops.load(SeqCst), 1);
        assert_eq!(h.namer.titles().len(), 1);
        assert_eq!(app.instances(), 1);
        assert!(h.reporter.errors().is_empty());
    }

    #[test]
    fn failing_success_callback_fires_false() {
        let flags = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks = CallbackRegistry::new();
        callbacks
            .register(EventKind::Connect, {
                let flags = Arc::clone(&flags);
                Hook::dispatch(move |success| {
                    flags.lock().unwrap().push(success);
                    if success {
                        Err(generic_error!("metrics sink unavailable"))
                    } else {
                        Ok(())
                    }
                })
            })
            .unwrap();

        let h = Harness::new(false, RecordingApplication::default(), callbacks);
        let outcome = block_on(async {
            h.dispatcher.on_worker_start(0).await.outcome().await;
            h.dispatcher
                .on_connect(h.server(), ConnectionId::new(1), 0)
                .await
                .outcome()
                .await
        });

        assert!(matches!(outcome, DispatchOutcome::ApplicationError(_)));
        assert_eq!(*flags.lock().unwrap(), vec![true, false]);
        assert_eq!(h.reporter.errors().len(), 1);
    }

    #[test]
    fn failing_failure_callback_is_fatal() {
        let mut callbacks = CallbackRegistry::new();
        callbacks
            .register(
                EventKind::Close,
                Hook::dispatch(|success| {
                    if success {
                        Ok(())
                    } else {
                        Err(generic_error!("alerting failed"))
                    }
                }),
            )
            .unwrap();

        let app = RecordingApplication::failing_on(EventKind::Close);
        let h = Harness::new(false, app.clone(), callbacks);
        let outcome = block_on(async {
            h.dispatcher.on_worker_start(0).await.outcome().await;
            h.dispatcher
                .on_close(h.server(), ConnectionId::new(1), 0)
                .await
                .outcome()
                .await
        });

        assert!(outcome.is_fatal());
        assert_eq!(
            h.reporter.errors(),
            vec!["close handler failed".to_string(), "alerting failed".to_string()]
        );
        assert_eq!(app.cleanups(), 2);
    }

    #[test]
    fn connection_event_without_application_is_an_application_error() {
        let (callbacks, flags) = flag_recorder(EventKind::Connect);
        let app = RecordingApplication::default();
        let h = Harness::new(false, app.clone(), callbacks);

        let outcome = block_on(async {
            h.dispatcher
                .on_connect(h.server(), ConnectionId::new(1), 0)
                .await
                .outcome()
                .await
        });

        assert!(matches!(outcome, DispatchOutcome::ApplicationError(_)));
        assert!(h.reporter.errors()[0].contains("Application not initialized"));
        assert_eq!(*flags.lock().unwrap(), vec![false]);
        assert_eq!(app.cleanups(), 0);
    }

    #[test]
    fn failed_initialization_skips_the_start_hook() {
        let starts = Arc::new(AtomicUsize::new(0));
        let mut callbacks = CallbackRegistry::new();
        callbacks
            .register(EventKind::ManagerStart, {
                let starts = Arc::clone(&starts);
                Hook::lifecycle(move || {
                    starts.fetch_add(1, SeqCst);
                    Ok(())
                })
            })
            .unwrap();

        let reporter = RecordingReporter::default();
        let namer = RecordingNamer::default();
        let dispatcher = Dispatcher::new(DispatcherContext {
            service: "tcpd".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9503,
            config_file: PathBuf::from("missing.yaml"),
            worker_num: 1,
            bridge: Bridge::new(Arc::new(CountingScheduler::default()), false),
            callbacks,
            factory: Arc::new(|_: &std::path::Path| -> Result<Arc<dyn Application>, GenericError> {
                Err(generic_error!("config file not found"))
            }),
            reporter: Arc::new(reporter.clone()),
            namer: Arc::new(namer.clone()),
        });

        let outcome = block_on(async { dispatcher.on_manager_start().await.outcome().await });

        assert!(matches!(outcome, DispatchOutcome::ApplicationError(_)));
        assert_eq!(starts.load(SeqCst), 0);
        assert_eq!(dispatcher.role(), Some(ProcessRole::Manager));
        assert_eq!(namer.titles(), vec!["tcpd: manager".to_string()]);
        assert!(reporter.errors()[0].contains("config file not found"));
    }
}
