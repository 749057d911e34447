//! Tunnel client errors and reconnect notification plumbing

use thiserror::Error;
use tokio::sync::oneshot;

use backhaul_transport::TransportError;

/// Terminal outcome of one coalesced reconnect attempt, delivered to every
/// caller that was waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The transport was replaced in place; callers may retry.
    Recovered,
    /// The retry budget is exhausted; the stream wrapper is shutting down.
    Failed,
}

/// Wait handle carried by [`TunnelError::ReconnectNeeded`].
///
/// Blocking on it yields the outcome of the single in-flight reconnect
/// attempt, however many callers requested it.
#[derive(Debug)]
pub struct ReconnectHandle {
    rx: oneshot::Receiver<ReconnectOutcome>,
}

impl ReconnectHandle {
    pub(crate) fn new(rx: oneshot::Receiver<ReconnectOutcome>) -> Self {
        Self { rx }
    }

    /// Wait for the reconnect attempt to resolve. A dropped worker counts as
    /// a failure.
    pub async fn wait(self) -> ReconnectOutcome {
        self.rx.await.unwrap_or(ReconnectOutcome::Failed)
    }
}

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The transport failed; a reconnect is pending. Block on the handle to
    /// learn its outcome.
    #[error("Transport failed, reconnect pending")]
    ReconnectNeeded(ReconnectHandle),

    #[error("Reconnect budget exhausted for server {0}")]
    Exhausted(String),

    #[error("Already connected to server {0}")]
    DuplicateServer(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
