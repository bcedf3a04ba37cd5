//! Dedicated runtimes.
//!
//! Every role runs on its own OS thread with its own Tokio runtime, which stands in for a separate process: tasks
//! within a role interleave, but never run on another role's threads.

use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use snafu::{ResultExt as _, Snafu};
use tokio::runtime::Runtime;

/// Engine errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum EngineError {
    /// No event handler was bound before the engine was started.
    #[snafu(display("No event handler bound to the engine."))]
    Unbound,

    /// Failed to bind to the listen address.
    #[snafu(display("Failed to bind to listen address {}: {}", address, source))]
    FailedToBind {
        /// Listen address.
        address: String,

        /// Error source.
        source: io::Error,
    },

    /// Failed to build the runtime for a role.
    #[snafu(display("Failed to build runtime for {}: {}", role, source))]
    FailedToBuildRuntime {
        /// Role the runtime was for.
        role: String,

        /// Error source.
        source: io::Error,
    },

    /// Failed to spawn the thread for a role.
    #[snafu(display("Failed to spawn thread '{}': {}", thread_name, source))]
    FailedToSpawnThread {
        /// Name of the thread.
        thread_name: String,

        /// Error source.
        source: io::Error,
    },
}

/// Builds a multi-threaded runtime whose threads are named `<name>-NN`.
pub(crate) fn multi_threaded(name: &str, worker_threads: usize) -> Result<Runtime, EngineError> {
    let thread_prefix = name.to_string();
    let thread_id = Arc::new(AtomicUsize::new(0));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(worker_threads)
        .thread_name_fn(move || {
            let new_thread_id = thread_id.fetch_add(1, Ordering::SeqCst);
            format!("{}-{:02}", thread_prefix, new_thread_id)
        })
        .build()
        .context(FailedToBuildRuntime { role: name })
}

/// Builds a single-threaded runtime.
pub(crate) fn single_threaded(name: &str) -> Result<Runtime, EngineError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context(FailedToBuildRuntime { role: name })
}

/// Spawns a named OS thread that runs `f`.
pub(crate) fn spawn_thread<F, T>(thread_name: String, f: F) -> Result<JoinHandle<T>, EngineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(f)
        .context(FailedToSpawnThread { thread_name })
}
