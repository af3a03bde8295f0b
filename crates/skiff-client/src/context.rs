//! The caller-supplied context governing a call.

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How a call context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallEnd {
    Cancelled,
    DeadlineExceeded,
}

/// Cancellation scope and optional deadline for a call.
///
/// Clones share the same cancellation signal, so a context can be handed to
/// a call and cancelled from elsewhere. The deadline, when set, is enforced
/// by the pending entry's watcher; the framework itself keeps no timers
/// beyond what a context asks for.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this context that additionally expires at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A copy of this context that additionally expires after `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Signal cancellation to every call governed by this context.
    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the context to end, reporting why.
    pub(crate) async fn ended(&self) -> CallEnd {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => CallEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CallEnd::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                CallEnd::Cancelled
            }
        }
    }
}
