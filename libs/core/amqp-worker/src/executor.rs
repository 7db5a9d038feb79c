//! Task executor boundary.

use crate::delivery::{Outcome, Task};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// What an executor did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Work finished; the consumer resolves the delivery with this outcome
    Completed(Outcome),
    /// Work continues elsewhere; someone calls `resolve(correlation_id, ..)` later
    Deferred,
}

impl From<Outcome> for Submission {
    fn from(outcome: Outcome) -> Self {
        Submission::Completed(outcome)
    }
}

/// Performs the work for one delivery.
///
/// Executors never fail: anything that goes wrong is reported as an
/// [`Outcome`], where `RetryableFailure` requeues the delivery and
/// `PermanentFailure` drops or dead-letters it.
///
/// # Example
///
/// ```rust,ignore
/// use amqp_worker::{Outcome, Submission, Task, TaskExecutor};
/// use async_trait::async_trait;
///
/// struct ThumbnailExecutor;
///
/// #[async_trait]
/// impl TaskExecutor for ThumbnailExecutor {
///     async fn submit(&self, task: Task) -> Submission {
///         match render(&task.payload).await {
///             Ok(_) => Outcome::Success.into(),
///             Err(e) if e.is_temporary() => Outcome::RetryableFailure.into(),
///             Err(_) => Outcome::PermanentFailure.into(),
///         }
///     }
///
///     fn name(&self) -> &'static str {
///         "thumbnail_executor"
///     }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Process (or hand off) a task.
    async fn submit(&self, task: Task) -> Submission;

    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str;
}

/// Executor backed by an async closure.
pub struct FnExecutor<F, Fut> {
    name: &'static str,
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnExecutor<F, Fut> {
    pub fn new(name: &'static str, f: F) -> Self {
        Self {
            name,
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, S> TaskExecutor for FnExecutor<F, Fut>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = S> + Send,
    S: Into<Submission> + Send,
{
    async fn submit(&self, task: Task) -> Submission {
        (self.f)(task).await.into()
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// An executor that succeeds immediately (for testing).
#[derive(Debug, Clone, Default)]
pub struct NoOpExecutor;

#[async_trait]
impl TaskExecutor for NoOpExecutor {
    async fn submit(&self, _task: Task) -> Submission {
        Submission::Completed(Outcome::Success)
    }

    fn name(&self) -> &'static str {
        "noop_executor"
    }
}

/// An executor that always fails (for testing).
#[derive(Debug, Clone)]
pub struct FailingExecutor {
    retryable: bool,
}

impl FailingExecutor {
    /// Fail with `RetryableFailure`, requeueing every delivery.
    pub fn retryable() -> Self {
        Self { retryable: true }
    }

    /// Fail with `PermanentFailure`, dead-lettering every delivery.
    pub fn permanent() -> Self {
        Self { retryable: false }
    }
}

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn submit(&self, _task: Task) -> Submission {
        if self.retryable {
            Submission::Completed(Outcome::RetryableFailure)
        } else {
            Submission::Completed(Outcome::PermanentFailure)
        }
    }

    fn name(&self) -> &'static str {
        "failing_executor"
    }
}
