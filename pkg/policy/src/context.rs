use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use pkg_types::{PolicyError, Result};

/// Deadline and cancellation for one evaluation.
///
/// An evaluation that is canceled or runs past its deadline fails with
/// [`PolicyError::Canceled`], which the evaluators turn into a Deny.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl EvalContext {
    /// No deadline, never canceled from the outside.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Share `token`; canceling it aborts this evaluation.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast if the evaluation is already canceled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(PolicyError::Canceled);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is canceled or the
    /// deadline passes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PolicyError::Canceled),
            _ = deadline => Err(PolicyError::Canceled),
            out = fut => Ok(out),
        }
    }
}
