//! End-to-end worker scenarios against the in-memory registry and scanner.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scantask_core::error::{Result, TaskError};
use scantask_core::{JobState, TaskResponse, TaskRunStatus, WorkerConfig};
use scantask_queue::{JobConsumer, JobMessage, ResultPublisher, Worker};
use scantask_runtime::oci::{
    AadTokenSource, AcrResolver, EcrAuthorization, EcrResolver, EcrTokenApi, GhcrResolver,
};
use scantask_runtime::testing::{SampleImage, StaticScanner};
use scantask_runtime::{RegistryResolvers, ScanPipeline};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const REF: &str = "ghcr.io/example/app:v1.0";
const REPORT: &str = r#"{"matches":[{"vulnerability":{"id":"CVE-2024-0001","severity":"High"}}]}"#;

struct QueuedMessage {
    payload: Vec<u8>,
    signals: AtomicUsize,
    acks: AtomicUsize,
}

impl QueuedMessage {
    fn new(payload: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            payload: payload.into(),
            signals: AtomicUsize::new(0),
            acks: AtomicUsize::new(0),
        })
    }

    fn job(run_id: u64, params: serde_json::Value) -> Arc<Self> {
        let payload = serde_json::json!({"runID": run_id, "params": params});
        Self::new(serde_json::to_vec(&payload).unwrap())
    }
}

#[async_trait]
impl JobMessage for QueuedMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn in_progress(&self) -> Result<()> {
        self.signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ack(&self) -> Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryConsumer {
    queue: Mutex<VecDeque<Arc<QueuedMessage>>>,
}

impl MemoryConsumer {
    fn with(messages: &[Arc<QueuedMessage>]) -> Self {
        Self {
            queue: Mutex::new(messages.iter().cloned().collect()),
        }
    }
}

#[async_trait]
impl JobConsumer for MemoryConsumer {
    async fn next(&self) -> Result<Option<Arc<dyn JobMessage>>> {
        let next = self.queue.lock().unwrap().pop_front();
        Ok(next.map(|m| m as Arc<dyn JobMessage>))
    }
}

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingPublisher {
    fn sent(&self) -> Vec<(String, serde_json::Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish(&self, message_id: &str, payload: Vec<u8>) -> Result<()> {
        let value = serde_json::from_slice(&payload).unwrap();
        self.sent
            .lock()
            .unwrap()
            .push((message_id.to_string(), value));
        Ok(())
    }
}

struct NoEcr;

#[async_trait]
impl EcrTokenApi for NoEcr {
    async fn authorization_token(&self, _: &str, _: &str) -> Result<Option<EcrAuthorization>> {
        Ok(None)
    }
}

struct NoAad;

#[async_trait]
impl AadTokenSource for NoAad {
    async fn access_token(&self, _: &str) -> Result<String> {
        Err(TaskError::Other("no identity".to_string()))
    }
}

struct Harness {
    _work: TempDir,
    scanner: Arc<StaticScanner>,
    publisher: Arc<RecordingPublisher>,
    worker: Worker,
}

fn harness(scanner: StaticScanner) -> Harness {
    let work = TempDir::new().unwrap();
    let config = WorkerConfig {
        work_dir: work.path().to_path_buf(),
        ..Default::default()
    };
    let scanner = Arc::new(scanner);
    let resolvers = RegistryResolvers::new(
        GhcrResolver,
        EcrResolver::new(Arc::new(NoEcr)),
        AcrResolver::new(Arc::new(NoAad)).unwrap(),
    );
    let pipeline = ScanPipeline::new(
        resolvers,
        Arc::new(SampleImage::new(2).registry(REF)),
        scanner.clone(),
        &config,
    );
    let publisher = Arc::new(RecordingPublisher::default());
    let worker = Worker::new(Arc::new(pipeline), publisher.clone(), &config);

    Harness {
        _work: work,
        scanner,
        publisher,
        worker,
    }
}

fn ghcr_params() -> serde_json::Value {
    serde_json::json!({
        "oci_artifact_url": REF,
        "github_username": "octocat",
        "github_token": "ghp_token",
    })
}

#[tokio::test]
async fn test_successful_scan_reports_finished() {
    let h = harness(StaticScanner::new(REPORT));
    let message = QueuedMessage::job(42, ghcr_params());

    let outcome = h.worker.handle(message.clone()).await;

    assert_eq!(outcome.state, JobState::Finished);
    assert_eq!(outcome.run_id, Some(42));
    assert_eq!(message.acks.load(Ordering::SeqCst), 1);

    let sent = h.publisher.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, "task-run-inprogress-42");
    assert_eq!(sent[0].1, serde_json::json!({"runID": 42, "status": "in-progress"}));

    assert_eq!(sent[1].0, "task-run-result-42");
    let result: TaskResponse = serde_json::from_value(sent[1].1.clone()).unwrap();
    assert_eq!(result.status, TaskRunStatus::Finished);
    assert_eq!(result.result.as_deref(), Some(REPORT.as_bytes()));
    assert_eq!(result.failure_message, None);

    let seen = h.scanner.seen_manifests.lock().unwrap();
    assert_eq!(seen[0][0].repo_tags, vec![REF]);
    assert_eq!(seen[0][0].layers, vec!["layer1.tar", "layer2.tar"]);
}

#[tokio::test]
async fn test_missing_artifact_url_reports_failed() {
    let h = harness(StaticScanner::new(REPORT));
    let message = QueuedMessage::job(43, serde_json::json!({"github_username": "octocat"}));

    let outcome = h.worker.handle(message.clone()).await;

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(message.acks.load(Ordering::SeqCst), 1);
    assert_eq!(h.scanner.scan_count(), 0);

    let sent = h.publisher.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[1].1,
        serde_json::json!({
            "runID": 43,
            "status": "failed",
            "failureMessage": "OCI artifact url parameter is not provided",
        })
    );
}

#[tokio::test]
async fn test_scanner_failure_carries_output() {
    let h = harness(StaticScanner::failing("exit status: 1", "db update failed"));
    let message = QueuedMessage::job(44, ghcr_params());

    h.worker.handle(message.clone()).await;

    let sent = h.publisher.sent();
    let result: TaskResponse = serde_json::from_value(sent[1].1.clone()).unwrap();
    assert_eq!(result.status, TaskRunStatus::Failed);
    assert_eq!(result.result.as_deref(), Some(&b"db update failed"[..]));
    assert!(result.failure_message.unwrap().contains("exit status: 1"));
    assert_eq!(message.acks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lease_is_renewed_during_slow_scan() {
    let h = harness(StaticScanner::new(REPORT).with_delay(Duration::from_secs(40)));
    let message = QueuedMessage::job(45, ghcr_params());

    let outcome = h.worker.handle(message.clone()).await;

    // one initial signal plus renewals at 15s and 30s
    assert_eq!(outcome.renewals, 2);
    assert_eq!(message.signals.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(message.signals.load(Ordering::SeqCst), 3);
    assert_eq!(message.acks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_run_drains_consumer_in_order() {
    let h = harness(StaticScanner::new(REPORT));
    let first = QueuedMessage::job(1, ghcr_params());
    let bad = QueuedMessage::new("{broken");
    let second = QueuedMessage::job(2, ghcr_params());
    let consumer = MemoryConsumer::with(&[first.clone(), bad.clone(), second.clone()]);

    h.worker
        .run(&consumer, CancellationToken::new())
        .await
        .unwrap();

    for message in [&first, &bad, &second] {
        assert_eq!(message.acks.load(Ordering::SeqCst), 1);
    }
    let ids: Vec<String> = h.publisher.sent().into_iter().map(|(id, _)| id).collect();
    assert_eq!(
        ids,
        vec![
            "task-run-inprogress-1",
            "task-run-result-1",
            "task-run-inprogress-2",
            "task-run-result-2",
        ]
    );
}

#[tokio::test]
async fn test_cancelled_worker_takes_no_jobs() {
    let h = harness(StaticScanner::new(REPORT));
    let message = QueuedMessage::job(3, ghcr_params());
    let consumer = MemoryConsumer::with(&[message.clone()]);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    h.worker.run(&consumer, shutdown).await.unwrap();

    assert_eq!(message.acks.load(Ordering::SeqCst), 0);
    assert!(h.publisher.sent().is_empty());
}
