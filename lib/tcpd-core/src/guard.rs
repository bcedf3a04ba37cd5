//! Resource scope guard.

use std::{future::Future, panic::AssertUnwindSafe};

use futures::FutureExt as _;
use tcpd_error::{panic_to_error, ErrorContext as _, GenericError};
use tracing::error;

use crate::{application::ErrorReporter, event::DispatchOutcome};

/// Runs a cleanup action exactly once.
///
/// The cleanup runs either when the guard is explicitly released or, failing that, when the guard is dropped, such as
/// when the future holding it is cancelled.
pub struct ScopeGuard<F>
where
    F: FnOnce() -> Result<(), GenericError>,
{
    cleanup: Option<F>,
}

impl<F> ScopeGuard<F>
where
    F: FnOnce() -> Result<(), GenericError>,
{
    /// Creates a new `ScopeGuard` around the given cleanup action.
    pub fn new(cleanup: F) -> Self {
        Self { cleanup: Some(cleanup) }
    }

    /// Runs the cleanup action now.
    ///
    /// # Errors
    ///
    /// If the cleanup action fails, its error is returned.
    pub fn release(mut self) -> Result<(), GenericError> {
        match self.cleanup.take() {
            Some(cleanup) => cleanup(),
            None => Ok(()),
        }
    }
}

impl<F> Drop for ScopeGuard<F>
where
    F: FnOnce() -> Result<(), GenericError>,
{
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            if let Err(e) = cleanup() {
                error!(error = %format_args!("{:#}", e), "Teardown failed for abandoned dispatch.");
            }
        }
    }
}

/// Runs `body`, then runs `cleanup` exactly once, whatever way `body` exits.
///
/// A panic in `body` becomes [`DispatchOutcome::FatalError`]. If `cleanup` fails or panics, its error is reported to
/// `reporter` and the outcome becomes [`DispatchOutcome::FatalError`], regardless of the outcome of `body`. Errors that
/// `body` already reported stay reported.
pub async fn run_with_cleanup<B, C>(body: B, cleanup: C, reporter: &dyn ErrorReporter) -> DispatchOutcome
where
    B: Future<Output = DispatchOutcome>,
    C: FnOnce() -> Result<(), GenericError>,
{
    let guard = ScopeGuard::new(cleanup);

    let outcome = match AssertUnwindSafe(body).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let e = panic_to_error(payload);
            reporter.handle_exception(&e);
            DispatchOutcome::FatalError(e)
        }
    };

    let teardown = match std::panic::catch_unwind(AssertUnwindSafe(|| guard.release())) {
        Ok(result) => result.error_context("Failed to clean up components."),
        Err(payload) => Err(panic_to_error(payload)),
    };

    match teardown {
        Ok(()) => outcome,
        Err(e) => {
            reporter.handle_exception(&e);
            DispatchOutcome::FatalError(e)
        }
    }
}
