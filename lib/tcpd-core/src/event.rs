//! Engine events and dispatch outcomes.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tcpd_error::GenericError;

/// Identifier of a single client connection, unique for the lifetime of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of this identifier.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of engine event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The master process started.
    Start,

    /// The manager process started.
    ManagerStart,

    /// The manager process is stopping.
    ManagerStop,

    /// A worker (or task worker) process started.
    WorkerStart,

    /// A worker (or task worker) process is stopping.
    WorkerStop,

    /// A client connected.
    Connect,

    /// Data was received from a client.
    Receive,

    /// A client connection was closed.
    Close,
}

impl EventKind {
    /// All event kinds, in lifecycle order.
    pub const ALL: [EventKind; 8] = [
        Self::Start,
        Self::ManagerStart,
        Self::ManagerStop,
        Self::WorkerStart,
        Self::WorkerStop,
        Self::Connect,
        Self::Receive,
        Self::Close,
    ];

    /// Returns `true` if this is a per-connection event.
    pub const fn is_connection_event(&self) -> bool {
        matches!(self, Self::Connect | Self::Receive | Self::Close)
    }

    /// Returns the name of this event kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ManagerStart => "manager_start",
            Self::ManagerStop => "manager_stop",
            Self::WorkerStart => "worker_start",
            Self::WorkerStop => "worker_stop",
            Self::Connect => "connect",
            Self::Receive => "receive",
            Self::Close => "close",
        }
    }

    /// Returns the operator-facing settings key for this kind's hook, such as `receive_callback`.
    pub fn callback_key(&self) -> String {
        format!("{}_callback", self.as_str())
    }

    /// Looks up an event kind by its operator-facing settings key.
    pub fn from_callback_key(key: &str) -> Option<Self> {
        let name = key.strip_suffix("_callback")?;
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event delivered by the engine, along with its payload.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// The master process started.
    Start,

    /// The manager process started.
    ManagerStart,

    /// The manager process is stopping.
    ManagerStop,

    /// A worker (or task worker) process started.
    WorkerStart {
        /// Index of the worker.
        worker_id: usize,
    },

    /// A worker (or task worker) process is stopping.
    WorkerStop {
        /// Index of the worker.
        worker_id: usize,
    },

    /// A client connected.
    Connect {
        /// Connection identifier.
        fd: ConnectionId,

        /// Reactor thread that accepted the connection.
        reactor_id: usize,
    },

    /// Data was received from a client.
    Receive {
        /// Connection identifier.
        fd: ConnectionId,

        /// Reactor thread that read the data.
        reactor_id: usize,

        /// Received bytes.
        data: Bytes,
    },

    /// A client connection was closed.
    Close {
        /// Connection identifier.
        fd: ConnectionId,

        /// Reactor thread that owned the connection.
        reactor_id: usize,
    },
}

impl EngineEvent {
    /// Returns the kind of this event.
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Start => EventKind::Start,
            Self::ManagerStart => EventKind::ManagerStart,
            Self::ManagerStop => EventKind::ManagerStop,
            Self::WorkerStart { .. } => EventKind::WorkerStart,
            Self::WorkerStop { .. } => EventKind::WorkerStop,
            Self::Connect { .. } => EventKind::Connect,
            Self::Receive { .. } => EventKind::Receive,
            Self::Close { .. } => EventKind::Close,
        }
    }

    /// Returns the connection this event belongs to, if it is a per-connection event.
    pub const fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Connect { fd, .. } | Self::Receive { fd, .. } | Self::Close { fd, .. } => Some(*fd),
            _ => None,
        }
    }
}

/// Result of a single dispatch.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The handler, and its hook, completed without error.
    Success,

    /// Application logic failed. The error has already been reported.
    ApplicationError(GenericError),

    /// Something failed outside of application logic: a panic, a failing teardown, or a failing failure hook.
    FatalError(GenericError),
}

impl DispatchOutcome {
    /// Returns `true` if the dispatch succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns `true` if the dispatch ended in a fatal error.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalError(_))
    }

    /// Returns the error behind a failed dispatch, if any.
    pub fn error(&self) -> Option<&GenericError> {
        match self {
            Self::Success => None,
            Self::ApplicationError(e) | Self::FatalError(e) => Some(e),
        }
    }
}
