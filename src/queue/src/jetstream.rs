//! NATS JetStream adapter for the queue ports.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use scantask_core::config::QueueConfig;
use scantask_core::error::{Result, TaskError};
use tokio::sync::Mutex;

use crate::message::{JobConsumer, JobMessage, ResultPublisher};

const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

/// Connection to a JetStream server with the job stream in place.
pub struct JetStreamQueue {
    client: async_nats::Client,
    context: jetstream::Context,
    stream: stream::Stream,
    config: QueueConfig,
}

impl JetStreamQueue {
    /// Connect and create the stream if it does not exist yet.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        tracing::info!(url = %config.url, "Connecting to NATS");
        let client = async_nats::connect(config.url.as_str())
            .await
            .map_err(|e| queue_error("connect", e))?;
        let context = jetstream::new(client.clone());

        let stream = context
            .get_or_create_stream(stream_config(config))
            .await
            .map_err(|e| queue_error("create stream", e))?;

        tracing::info!(
            stream = %config.stream_name,
            topic = %config.topic,
            result_topic = %config.result_topic,
            "Stream ready"
        );

        Ok(Self {
            client,
            context,
            stream,
            config: config.clone(),
        })
    }

    /// Durable pull consumer on the job subject, one message at a time.
    pub async fn consumer(&self) -> Result<JetStreamConsumer> {
        let pull_consumer: consumer::PullConsumer = self
            .stream
            .get_or_create_consumer(&self.config.consumer, consumer_config(&self.config))
            .await
            .map_err(|e| queue_error("create consumer", e))?;

        let messages = pull_consumer
            .stream()
            .max_messages_per_batch(1)
            .messages()
            .await
            .map_err(|e| queue_error("subscribe", e))?;

        tracing::info!(consumer = %self.config.consumer, "Consumer ready");
        Ok(JetStreamConsumer {
            messages: Mutex::new(messages),
        })
    }

    /// Publisher for the result subject.
    pub fn publisher(&self) -> JetStreamPublisher {
        JetStreamPublisher {
            context: self.context.clone(),
            subject: self.config.result_topic.clone(),
        }
    }

    /// Flush buffered publishes before shutdown.
    pub async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| queue_error("flush", e))
    }
}

fn stream_config(config: &QueueConfig) -> stream::Config {
    stream::Config {
        name: config.stream_name.clone(),
        description: Some("task job queue".to_string()),
        subjects: vec![config.topic.clone(), config.result_topic.clone()],
        max_messages: config.stream_max_messages,
        ..Default::default()
    }
}

fn consumer_config(config: &QueueConfig) -> consumer::pull::Config {
    consumer::pull::Config {
        durable_name: Some(config.consumer.clone()),
        filter_subject: config.topic.clone(),
        ack_policy: consumer::AckPolicy::Explicit,
        deliver_policy: consumer::DeliverPolicy::All,
        max_ack_pending: -1,
        num_replicas: 1,
        ack_wait: Duration::from_secs(config.ack_wait_secs),
        inactive_threshold: Duration::from_secs(config.inactive_threshold_secs),
        ..Default::default()
    }
}

fn queue_error(action: &str, e: impl std::fmt::Display) -> TaskError {
    TaskError::QueueError(format!("{}: {}", action, e))
}

/// Pull consumer yielding one leased message at a time.
pub struct JetStreamConsumer {
    messages: Mutex<consumer::pull::Stream>,
}

#[async_trait]
impl JobConsumer for JetStreamConsumer {
    async fn next(&self) -> Result<Option<Arc<dyn JobMessage>>> {
        let mut messages = self.messages.lock().await;
        match messages.next().await {
            Some(Ok(message)) => Ok(Some(Arc::new(JetStreamMessage { inner: message }))),
            Some(Err(e)) => Err(queue_error("receive", e)),
            None => Ok(None),
        }
    }
}

struct JetStreamMessage {
    inner: jetstream::Message,
}

#[async_trait]
impl JobMessage for JetStreamMessage {
    fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    async fn in_progress(&self) -> Result<()> {
        self.inner
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| queue_error("in-progress", e))
    }

    async fn ack(&self) -> Result<()> {
        self.inner.ack().await.map_err(|e| queue_error("ack", e))
    }
}

/// Publishes progress and results with a de-duplication header.
#[derive(Clone)]
pub struct JetStreamPublisher {
    context: jetstream::Context,
    subject: String,
}

#[async_trait]
impl ResultPublisher for JetStreamPublisher {
    async fn publish(&self, message_id: &str, payload: Vec<u8>) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MESSAGE_ID_HEADER, message_id);

        let publish_error = |e: &dyn std::fmt::Display| TaskError::QueuePublishError {
            message_id: message_id.to_string(),
            message: e.to_string(),
        };

        let ack = self
            .context
            .publish_with_headers(self.subject.clone(), headers, payload.into())
            .await
            .map_err(|e| publish_error(&e))?;
        ack.await.map_err(|e| publish_error(&e))?;

        tracing::debug!(message_id, subject = %self.subject, "Published message");
        Ok(())
    }
}
