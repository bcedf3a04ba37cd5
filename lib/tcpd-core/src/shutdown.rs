//! Process shutdown coordination.

use tokio_util::sync::CancellationToken;

/// A shutdown signal for a process.
///
/// This struct can be used to wait for a shutdown signal from whoever holds the paired [`ShutdownHandle`].
pub struct ProcessShutdown {
    token: CancellationToken,
}

/// A handle to trigger process shutdown.
///
/// Handles can be cloned freely, and any clone can trigger shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ProcessShutdown {
    /// Creates a new `ProcessShutdown` and `ShutdownHandle` pair.
    ///
    /// When `ShutdownHandle` is triggered, `ProcessShutdown` will resolve.
    pub fn paired() -> (Self, ShutdownHandle) {
        let token = CancellationToken::new();
        let handle = ShutdownHandle { token: token.clone() };

        (Self { token }, handle)
    }

    /// Creates a child `ProcessShutdown` and `ShutdownHandle` pair.
    ///
    /// The child resolves when either its own handle is triggered or this shutdown signal resolves. Triggering the
    /// child does not affect this shutdown signal.
    pub fn child(&self) -> (Self, ShutdownHandle) {
        let token = self.token.child_token();
        let handle = ShutdownHandle { token: token.clone() };

        (Self { token }, handle)
    }

    /// Returns `true` if the shutdown signal has already been received.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for the shutdown signal to be received.
    ///
    /// If the shutdown signal has been received during a previous call to this function, this function will return
    /// immediately for all subsequent calls.
    pub async fn wait_for_shutdown(&mut self) {
        self.token.cancelled().await
    }
}

impl ShutdownHandle {
    /// Triggers the process to shutdown.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Returns `true` if shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}
