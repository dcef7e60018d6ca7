//! The job worker loop.
//!
//! For every message: extend the lease, start the heartbeat, announce
//! `in-progress`, run the pipeline, publish exactly one terminal result, stop
//! the heartbeat and acknowledge. The message is acknowledged once whatever
//! the pipeline outcome was; retrying is left to the queue operator.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use scantask_core::config::WorkerConfig;
use scantask_core::error::{Result, TaskError};
use scantask_core::job::{JobState, TaskRequest, TaskResponse};
use scantask_runtime::JobPipeline;
use tokio_util::sync::CancellationToken;

use crate::heartbeat::LeaseHeartbeat;
use crate::message::{JobConsumer, JobMessage, ResultPublisher};

/// Pause after a failed fetch from the consumer.
const CONSUME_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// `None` when the payload could not be decoded
    pub run_id: Option<u64>,
    pub state: JobState,
    pub failure_message: Option<String>,
    /// Successful lease renewals while the pipeline ran
    pub renewals: u32,
    pub acked: bool,
}

/// Consumes jobs one at a time and drives them through a [`JobPipeline`].
pub struct Worker {
    pipeline: Arc<dyn JobPipeline>,
    publisher: Arc<dyn ResultPublisher>,
    lease_interval: Duration,
}

impl Worker {
    pub fn new(
        pipeline: Arc<dyn JobPipeline>,
        publisher: Arc<dyn ResultPublisher>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            pipeline,
            publisher,
            lease_interval: config.lease_renewal_interval(),
        }
    }

    /// Consume until `shutdown` is cancelled or the consumer is exhausted.
    ///
    /// Cancellation stops the wait for new messages; a job already being
    /// handled runs to completion and is acknowledged first.
    pub async fn run(&self, consumer: &dyn JobConsumer, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Starting to consume");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = consumer.next() => next,
            };

            match next {
                Ok(Some(message)) => {
                    self.handle(message).await;
                }
                Ok(None) => {
                    tracing::info!("Job source closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to fetch next job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(CONSUME_RETRY_DELAY) => {}
                    }
                }
            }
        }

        tracing::info!("Stopped consuming");
        Ok(())
    }

    /// Process one message end to end and acknowledge it.
    pub async fn handle(&self, message: Arc<dyn JobMessage>) -> JobOutcome {
        tracing::info!("Received a new job");

        if let Err(e) = message.in_progress().await {
            tracing::warn!(error = %e, "Failed to send the initial in-progress signal");
        }

        let request = TaskRequest::from_slice(message.payload());
        let run_id = request.as_ref().map(|r| r.run_id).unwrap_or_default();

        let heartbeat = LeaseHeartbeat::start(message.clone(), self.lease_interval, run_id);
        let mut outcome = self.process(request).await;
        outcome.renewals = heartbeat.stop().await;

        match message.ack().await {
            Ok(()) => outcome.acked = true,
            Err(e) => tracing::error!(
                run_id = ?outcome.run_id,
                error = %e,
                "Failed to acknowledge job"
            ),
        }

        tracing::info!(
            run_id = ?outcome.run_id,
            state = ?outcome.state,
            renewals = outcome.renewals,
            "Processing a job completed"
        );
        outcome
    }

    async fn process(&self, request: Result<TaskRequest>) -> JobOutcome {
        let mut state = JobState::Received;

        let request = match request {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(error = %e, "Failed to decode job");
                return JobOutcome {
                    run_id: None,
                    state,
                    failure_message: Some(e.to_string()),
                    renewals: 0,
                    acked: false,
                };
            }
        };
        let run_id = request.run_id;

        advance(&mut state, JobState::InProgress, run_id);
        self.publish(
            &TaskResponse::progress_message_id(run_id),
            &TaskResponse::in_progress(run_id),
        )
        .await;

        let result = AssertUnwindSafe(self.pipeline.run(&request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::Other(panic_message(panic))));

        let (response, failure_message) = match result {
            Ok(output) => {
                advance(&mut state, JobState::Finished, run_id);
                (TaskResponse::finished(run_id, output), None)
            }
            Err(e) => {
                tracing::error!(run_id, error = %e, "Job failed");
                advance(&mut state, JobState::Failed, run_id);
                let message = e.to_string();
                let output = e.scanner_output().map(<[u8]>::to_vec);
                (
                    TaskResponse::failed(run_id, message.clone(), output),
                    Some(message),
                )
            }
        };

        self.publish(&TaskResponse::result_message_id(run_id), &response)
            .await;

        JobOutcome {
            run_id: Some(run_id),
            state,
            failure_message,
            renewals: 0,
            acked: false,
        }
    }

    /// Publish best-effort; failures are logged and never fail the job.
    async fn publish(&self, message_id: &str, response: &TaskResponse) {
        let result = match response.to_vec() {
            Ok(payload) => self.publisher.publish(message_id, payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let e = match e {
                e @ TaskError::QueuePublishError { .. } => e,
                other => TaskError::QueuePublishError {
                    message_id: message_id.to_string(),
                    message: other.to_string(),
                },
            };
            tracing::error!(
                run_id = response.run_id,
                status = ?response.status,
                error = %e,
                "Failed to publish job response"
            );
        }
    }
}

fn advance(state: &mut JobState, next: JobState, run_id: u64) {
    if let Err(e) = state.transition(next) {
        tracing::error!(run_id, error = %e, "Invalid job state transition");
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("pipeline panicked: {}", detail)
}
