//! Cancellation contexts for blocking stream operations
//!
//! A [`Context`] couples a [`CancellationToken`] with an optional deadline.
//! Stream cursors and insert writers race their suspension points against
//! [`Context::done`], so callers can give up on a read or an ack wait either
//! explicitly or by timing out.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{KsqlError, Result};

/// Why a [`Context`] fired.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never fires on its own.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a context that fires when this one does, or when cancelled itself.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child with a deadline. The earlier of the parent's and the
    /// new deadline wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check: `Some` once the context has fired.
    pub fn err(&self) -> Option<CancelCause> {
        if self.token.is_cancelled() {
            return Some(CancelCause::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context fires.
    pub async fn done(&self) -> CancelCause {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => CancelCause::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancelCause::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancelCause::Cancelled
            }
        }
    }

    /// Run `fut` to completion unless the context fires first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            cause = self.done() => Err(KsqlError::Cancelled(cause)),
            out = fut => out,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
