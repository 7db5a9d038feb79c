//! Executor that forwards tasks to an HTTP service.
//!
//! The payload is POSTed as-is with the correlation ID in the
//! `X-RabbitMQ-Delivery-Tag` header. A `202 Accepted` response means the
//! remote side took ownership and will report the outcome later through the
//! completion callback, echoing the header unchanged.

use crate::delivery::{CORRELATION_HEADER, Outcome, Task};
use crate::error::WorkerError;
use crate::executor::{Submission, TaskExecutor};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Header carrying the queue name
pub const QUEUE_HEADER: &str = "X-Queue";

/// Header carrying the broker-reported redelivery count
pub const REDELIVERY_COUNT_HEADER: &str = "X-Redelivery-Count";

const MIN_BREAKER_WAIT: Duration = Duration::from_millis(10);

/// Map an HTTP status to what happens to the delivery.
///
/// - `202` -> deferred to the completion callback
/// - other `2xx` -> `Success`
/// - `408`, `429`, `5xx` -> `RetryableFailure`
/// - other `4xx` -> `PermanentFailure`
pub fn submission_for_status(status: StatusCode) -> Submission {
    match status {
        StatusCode::ACCEPTED => Submission::Deferred,
        s if s.is_success() => Submission::Completed(Outcome::Success),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Submission::Completed(Outcome::RetryableFailure)
        }
        s if s.is_server_error() => Submission::Completed(Outcome::RetryableFailure),
        s if s.is_client_error() => Submission::Completed(Outcome::PermanentFailure),
        // 1xx/3xx should not reach us; let the broker try again
        _ => Submission::Completed(Outcome::RetryableFailure),
    }
}

/// POSTs tasks to a target URL.
pub struct HttpExecutor {
    client: reqwest::Client,
    url: String,
    breaker: Option<CircuitBreaker>,
}

impl HttpExecutor {
    /// Create an executor with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Executor(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(client, url))
    }

    /// Create an executor around an existing client.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            breaker: None,
        }
    }

    /// Stop calling the target while it keeps failing.
    ///
    /// While open, `submit` holds the task (and its concurrency permit)
    /// until the breaker lets a trial request through.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(CircuitBreaker::new(config));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn record(&self, submission: Submission) {
        let Some(breaker) = &self.breaker else {
            return;
        };
        match submission {
            Submission::Completed(Outcome::RetryableFailure) => breaker.record_failure(),
            _ => breaker.record_success(),
        }
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    #[instrument(skip(self, task), fields(correlation_id = %task.correlation_id, queue = %task.queue))]
    async fn submit(&self, task: Task) -> Submission {
        // Requeueing here would spin the delivery through the broker and burn its redeliveries
        if let Some(breaker) = &self.breaker {
            while !breaker.can_execute() {
                let wait = breaker.remaining_open().max(MIN_BREAKER_WAIT);
                debug!(wait_ms = wait.as_millis() as u64, "Circuit open, holding task");
                tokio::time::sleep(wait).await;
            }
        }

        let result = self
            .client
            .post(&self.url)
            .header(CORRELATION_HEADER, task.correlation_id.as_str())
            .header(QUEUE_HEADER, task.queue.as_str())
            .header(REDELIVERY_COUNT_HEADER, task.redelivery_count.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(task.payload)
            .send()
            .await;

        let submission = match result {
            Ok(response) => {
                let status = response.status();
                let submission = submission_for_status(status);
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    warn!(status = %status, body = %body, "Task target returned an error");
                }
                submission
            }
            Err(e) => {
                warn!(error = %e, timeout = e.is_timeout(), "Task request failed");
                Submission::Completed(Outcome::RetryableFailure)
            }
        };

        self.record(submission);
        debug!(?submission, "Task submitted over HTTP");
        submission
    }

    fn name(&self) -> &'static str {
        "http_executor"
    }
}
