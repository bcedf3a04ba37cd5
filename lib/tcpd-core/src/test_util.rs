//! Test doubles shared by the unit tests of this crate.
#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc, Mutex,
    },
    thread::ThreadId,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tcpd_error::{generic_error, GenericError};
use tokio::task::JoinHandle;

use crate::{
    application::{Application, ErrorReporter, ProcessNamer, TcpConnection},
    bridge::{ExecutionContext, Scheduler, TokioScheduler},
    engine::{Engine, EventHandler, ServerHandle, ServerRef},
    event::{ConnectionId, DispatchOutcome, EngineEvent, EventKind},
    settings::EngineSettings,
    shutdown::ProcessShutdown,
};

/// Records every reported error, rendered with its full chain.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    errors: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn handle_exception(&self, error: &GenericError) {
        self.errors.lock().unwrap().push(format!("{:#}", error));
    }
}

/// Records every process title that was set.
#[derive(Clone, Default)]
pub struct RecordingNamer {
    titles: Arc<Mutex<Vec<String>>>,
}

impl RecordingNamer {
    pub fn titles(&self) -> Vec<String> {
        self.titles.lock().unwrap().clone()
    }
}

impl ProcessNamer for RecordingNamer {
    fn set_process_title(&self, title: &str) {
        self.titles.lock().unwrap().push(title.to_string());
    }
}

/// A connection event as seen by [`RecordingApplication`].
#[derive(Clone, Debug)]
pub struct HandledEvent {
    pub kind: EventKind,
    pub fd: ConnectionId,
    pub data: Option<Bytes>,
    pub context: Option<ExecutionContext>,
}

#[derive(Default)]
struct ApplicationLog {
    events: Vec<HandledEvent>,
    cleanup_threads: Vec<ThreadId>,
    instances: usize,
}

/// An application that records what it handled, optionally failing on one event kind.
#[derive(Clone, Default)]
pub struct RecordingApplication {
    fail_on: Option<EventKind>,
    log: Arc<Mutex<ApplicationLog>>,
}

impl RecordingApplication {
    pub fn failing_on(kind: EventKind) -> Self {
        Self {
            fail_on: Some(kind),
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<HandledEvent> {
        self.log.lock().unwrap().events.clone()
    }

    pub fn cleanups(&self) -> usize {
        self.log.lock().unwrap().cleanup_threads.len()
    }

    pub fn cleanup_threads(&self) -> Vec<ThreadId> {
        self.log.lock().unwrap().cleanup_threads.clone()
    }

    /// Number of times the factory created this application.
    pub fn instances(&self) -> usize {
        self.log.lock().unwrap().instances
    }

    pub fn factory(&self) -> impl Fn(&Path) -> Result<Arc<dyn Application>, GenericError> + Send + Sync + 'static {
        let application = self.clone();
        move |_: &Path| {
            application.log.lock().unwrap().instances += 1;
            let instance: Arc<dyn Application> = Arc::new(application.clone());
            Ok(instance)
        }
    }

    fn record(&self, kind: EventKind, connection: &TcpConnection, data: Option<Bytes>) -> Result<(), GenericError> {
        self.log.lock().unwrap().events.push(HandledEvent {
            kind,
            fd: connection.id(),
            data,
            context: ExecutionContext::current(),
        });

        if self.fail_on == Some(kind) {
            return Err(generic_error!("{} handler failed", kind));
        }

        Ok(())
    }
}

#[async_trait]
impl Application for RecordingApplication {
    async fn run_connect(&self, connection: &TcpConnection) -> Result<(), GenericError> {
        self.record(EventKind::Connect, connection, None)
    }

    async fn run_receive(&self, connection: &TcpConnection, data: Bytes) -> Result<(), GenericError> {
        self.record(EventKind::Receive, connection, Some(data.clone()))?;
        connection.send(data)
    }

    async fn run_close(&self, connection: &TcpConnection) -> Result<(), GenericError> {
        self.record(EventKind::Close, connection, None)
    }

    fn clean_components(&self) -> Result<(), GenericError> {
        self.log.lock().unwrap().cleanup_threads.push(std::thread::current().id());
        Ok(())
    }
}

/// A server handle that records what was sent.
#[derive(Default)]
pub struct RecordingServer {
    sent: Mutex<Vec<(ConnectionId, Bytes)>>,
}

impl RecordingServer {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(ConnectionId, Bytes)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ServerHandle for RecordingServer {
    fn send(&self, fd: ConnectionId, data: Bytes) -> Result<(), GenericError> {
        self.sent.lock().unwrap().push((fd, data));
        Ok(())
    }

    fn close(&self, _fd: ConnectionId) -> Result<(), GenericError> {
        Ok(())
    }

    fn exists(&self, _fd: ConnectionId) -> bool {
        true
    }
}

/// A Tokio scheduler that counts spawned tasks.
#[derive(Clone, Default)]
pub struct CountingScheduler {
    spawned: Arc<AtomicUsize>,
}

impl CountingScheduler {
    pub fn spawned(&self) -> usize {
        self.spawned.load(SeqCst)
    }
}

impl Scheduler for CountingScheduler {
    fn is_inside_task(&self) -> bool {
        TokioScheduler.is_inside_task()
    }

    fn can_spawn(&self) -> bool {
        TokioScheduler.can_spawn()
    }

    fn spawn(&self, work: BoxFuture<'static, DispatchOutcome>) -> Result<JoinHandle<DispatchOutcome>, GenericError> {
        self.spawned.fetch_add(1, SeqCst);
        TokioScheduler.spawn(work)
    }
}

#[derive(Default)]
struct EngineLog {
    settings: Option<EngineSettings>,
    started: bool,
    outcomes: Vec<(EventKind, DispatchOutcome)>,
}

/// Observes a [`MockEngine`] after it has been moved into the server.
#[derive(Clone, Default)]
pub struct EngineProbe {
    log: Arc<Mutex<EngineLog>>,
}

impl EngineProbe {
    pub fn settings(&self) -> Option<EngineSettings> {
        self.log.lock().unwrap().settings.clone()
    }

    pub fn started(&self) -> bool {
        self.log.lock().unwrap().started
    }

    pub fn outcomes(&self) -> Vec<(EventKind, bool)> {
        self.log
            .lock()
            .unwrap()
            .outcomes
            .iter()
            .map(|(kind, outcome)| (*kind, outcome.is_success()))
            .collect()
    }
}

/// An engine that replays scripted events, one forked handler per scripted process.
///
/// Every event is dispatched from the root future of a current-thread runtime, so it is never inside a task.
pub struct MockEngine {
    processes: Vec<Vec<EngineEvent>>,
    handler: Option<Arc<dyn EventHandler>>,
    server: ServerRef,
    probe: EngineProbe,
}

impl MockEngine {
    pub fn new(processes: Vec<Vec<EngineEvent>>) -> (Self, EngineProbe) {
        let probe = EngineProbe::default();
        let engine = Self {
            processes,
            handler: None,
            server: RecordingServer::shared(),
            probe: probe.clone(),
        };
        (engine, probe)
    }
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn configure(&mut self, settings: EngineSettings) {
        self.probe.log.lock().unwrap().settings = Some(settings);
    }

    fn bind(&mut self, handler: Arc<dyn EventHandler>) {
        self.handler = Some(handler);
    }

    fn start(self: Box<Self>, _shutdown: ProcessShutdown) -> bool {
        let Self {
            processes,
            handler,
            server,
            probe,
        } = *self;
        let Some(handler) = handler else {
            return false;
        };
        probe.log.lock().unwrap().started = true;

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        for events in processes {
            let process = handler.fork();
            for event in events {
                let kind = event.kind();
                let outcome = runtime.block_on(async {
                    let dispatch = process.dispatch(Arc::clone(&server), event).await;
                    dispatch.outcome().await
                });
                probe.log.lock().unwrap().outcomes.push((kind, outcome));
            }
        }

        true
    }
}
