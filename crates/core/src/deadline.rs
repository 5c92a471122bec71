use crate::error::{RecallError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Shared time budget for a multi-stage operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Option<Instant>,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn unbounded() -> Self {
        Self {
            expires_at: None,
            budget: None,
        }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + budget),
            budget: Some(budget),
        }
    }

    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map_or_else(Self::unbounded, Self::after)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Runs `stage` within the remaining budget. The stage future is dropped on expiry.
    pub async fn run<T, F>(&self, stage: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(expires_at) = self.expires_at else {
            return future.await;
        };

        match tokio::time::timeout_at(expires_at, future).await {
            Ok(result) => result,
            Err(_) => Err(RecallError::Timeout {
                operation: stage.to_string(),
                after_ms: self.budget.map_or(0, |budget| budget.as_millis() as u64),
            }),
        }
    }
}
