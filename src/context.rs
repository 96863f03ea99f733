//! Cancellable execution context for a single call.
//!
//! A [`Context`] combines an explicit cancellation signal with an optional
//! deadline. Streaming loops poll it between iterations; nothing here
//! interrupts work that is already in flight.

use crate::error::Status;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The context (or one of its parents) was cancelled explicitly.
    Cancelled,
    /// The context's deadline has passed.
    DeadlineExceeded,
}

impl From<CancelReason> for Status {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => Status::cancelled("context canceled"),
            CancelReason::DeadlineExceeded => {
                Status::deadline_exceeded("context deadline exceeded")
            }
        }
    }
}

/// Governing context of a download or upload call.
///
/// # Examples
///
/// ```
/// use rspeed::context::{CancelReason, Context};
///
/// let root = Context::new();
/// let call = root.child();
///
/// root.cancel();
/// assert_eq!(call.cancel_reason(), Some(CancelReason::Cancelled));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Creates a root context that is never done until cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing token, e.g. the server's shutdown token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derives a context that is cancelled with its parent and inherits its
    /// deadline. Cancelling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Applies a deadline. An earlier inherited deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns the reason this context is done, or `None` while it is live.
    ///
    /// Explicit cancellation is reported in preference to an elapsed deadline.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.cancel_reason().is_some()
    }

    /// Waits until the context is cancelled or its deadline passes.
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => CancelReason::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }
}
