//! Event dispatch and process lifecycle coordination for multi-process TCP servers.
//!
//! A server is made up of a master process that accepts connections, a manager process that supervises workers, and a
//! pool of workers (optionally split into regular workers and task workers). The host [`Engine`] delivers
//! [`EngineEvent`]s for each of them; this crate decides what happens next:
//!
//! - every event runs inside exactly one task boundary ([`bridge`])
//! - every process enters its role exactly once ([`role`])
//! - every dispatch tears down component state exactly once ([`guard`])
//! - every event kind can have one validated hook ([`callbacks`])
//!
//! [`TcpServer`] ties these together and hands control to the engine.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod application;
pub mod bridge;
pub mod callbacks;
pub mod dispatcher;
pub mod engine;
pub mod event;
pub mod guard;
pub mod role;
pub mod server;
pub mod settings;
pub mod shutdown;

#[cfg(test)]
mod test_util;

pub use self::application::{
    Application, ApplicationFactory, ErrorReporter, LogErrorReporter, LogProcessNamer, ProcessNamer, TcpConnection,
};
pub use self::bridge::{Bridge, Dispatch, ExecutionContext, Placement, Scheduler, TokioScheduler};
pub use self::callbacks::{CallbackError, CallbackRegistry, Hook, HookShape};
pub use self::dispatcher::Dispatcher;
pub use self::engine::{Engine, EventHandler, ServerHandle, ServerRef};
pub use self::event::{ConnectionId, DispatchOutcome, EngineEvent, EventKind};
pub use self::role::{ProcessRole, RoleError, DEFAULT_SERVICE_NAME};
pub use self::server::{ServerError, TcpServer};
pub use self::settings::{EngineSettings, ServerConfig, Settings, SettingsError};
pub use self::shutdown::{ProcessShutdown, ShutdownHandle};
