//! Queue ports used by the worker.

use std::sync::Arc;

use async_trait::async_trait;
use scantask_core::error::Result;

/// One leased job message.
#[async_trait]
pub trait JobMessage: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Extend the processing lease.
    async fn in_progress(&self) -> Result<()>;

    /// Acknowledge the message so it is not redelivered.
    async fn ack(&self) -> Result<()>;
}

/// Source of job messages.
#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Wait for the next message. `None` means the source is exhausted.
    async fn next(&self) -> Result<Option<Arc<dyn JobMessage>>>;
}

/// Sink for progress and result messages.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    /// Publish `payload` with a de-duplication id.
    async fn publish(&self, message_id: &str, payload: Vec<u8>) -> Result<()>;
}
