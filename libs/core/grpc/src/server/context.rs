use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Why a [`ShutdownContext`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The context (or one of its parents) was cancelled explicitly.
    Cancelled,
    /// The deadline of the context (or one of its parents) elapsed.
    DeadlineExceeded,
}

/// Cancellation plus an optional deadline, passed to shutdown operations and hooks.
///
/// Children derived with [`with_timeout`](Self::with_timeout) are cancelled
/// together with their parent and never outlive the parent's deadline.
/// No timer task is spawned: the deadline is checked lazily in
/// [`done`](Self::done) and [`err`](Self::err).
#[derive(Debug, Clone, Default)]
pub struct ShutdownContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ShutdownContext {
    /// A context that is never done unless cancelled through its token.
    pub fn background() -> Self {
        Self::default()
    }

    /// Wraps an existing token, e.g. one shared with other subsystems.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Child context whose deadline is the earlier of the parent's and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// `None` while the context is live. An elapsed deadline wins over cancellation.
    pub fn err(&self) -> Option<ContextError> {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(ContextError::DeadlineExceeded)
        } else if self.token.is_cancelled() {
            Some(ContextError::Cancelled)
        } else {
            None
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }
}
