//! A tokio-based host engine for `tcpd-core`.
//!
//! [`LocalEngine`] runs the master, the manager, and every worker in a single OS process, giving each role its own
//! thread and runtime.
#![deny(warnings)]
#![deny(missing_docs)]

mod connection;
pub use self::connection::ConnectionRegistry;

mod engine;
pub use self::engine::LocalEngine;

mod manager;
mod router;

mod runtime;
pub use self::runtime::EngineError;

mod worker;
