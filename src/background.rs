//! Stop/stopped handshake for long-running loops.
//!
//! A loop is spawned with a [`CancellationToken`] and polls it at its select
//! point. [`Background::stop`] asks it to finish; [`Background::stopped`]
//! resolves once it has returned. Work the loop is in the middle of is always
//! completed first, since the token is only observed between iterations.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Background {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Background {
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(token.clone()));
        tracing::debug!(task = name, "background task started");
        Self {
            name,
            token,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Requests termination. Repeated calls have no further effect.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for the loop to return.
    pub async fn stopped(self) {
        match self.handle.await {
            Ok(()) => tracing::debug!(task = self.name, "background task stopped"),
            Err(e) => tracing::error!(task = self.name, "background task failed: {e}"),
        }
    }

    pub async fn shutdown(self) {
        self.stop();
        self.stopped().await;
    }
}
