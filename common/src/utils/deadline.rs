use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::AppError;

/// Absolute cutoff derived from a request's overall budget. External calls
/// are wrapped in the remaining slice so cancellation propagates.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Runs `fut` within the deadline's remaining budget; expiry maps to
/// `DependencyTimeout` and any partial work is dropped with the future.
pub async fn with_deadline<F, T>(
    label: &str,
    deadline: Deadline,
    fut: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    if deadline.expired() {
        return Err(AppError::Overloaded(format!(
            "deadline already expired before calling {label}"
        )));
    }

    match tokio::time::timeout(deadline.remaining(), fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::DependencyTimeout(label.to_owned())),
    }
}
