//! Job wire types and the job lifecycle.
//!
//! A job arrives as a [`TaskRequest`], moves through [`JobState`], and is
//! reported back as one or more [`TaskResponse`] messages correlated by the
//! run identifier.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};

/// Parameter key holding the artifact reference.
pub const PARAM_ARTIFACT_URL: &str = "oci_artifact_url";
/// Parameter key holding the registry kind.
pub const PARAM_REGISTRY_TYPE: &str = "registry_type";
/// Registry kind used when the job does not name one.
pub const DEFAULT_REGISTRY_TYPE: &str = "ghcr";

/// Job message consumed from the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "runID")]
    pub run_id: u64,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl TaskRequest {
    /// Decode a job from its raw queue payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| TaskError::InvalidJob(e.to_string()))
    }
}

/// Status reported on the result topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskRunStatus {
    InProgress,
    Finished,
    Failed,
}

/// Progress or result message published for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    #[serde(rename = "runID")]
    pub run_id: u64,
    pub status: TaskRunStatus,
    /// Raw scanner output, base64 encoded on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub result: Option<Vec<u8>>,
    #[serde(rename = "failureMessage", default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl TaskResponse {
    pub fn in_progress(run_id: u64) -> Self {
        Self {
            run_id,
            status: TaskRunStatus::InProgress,
            result: None,
            failure_message: None,
        }
    }

    pub fn finished(run_id: u64, output: Vec<u8>) -> Self {
        Self {
            run_id,
            status: TaskRunStatus::Finished,
            result: Some(output),
            failure_message: None,
        }
    }

    pub fn failed(run_id: u64, message: impl Into<String>, output: Option<Vec<u8>>) -> Self {
        Self {
            run_id,
            status: TaskRunStatus::Failed,
            result: output,
            failure_message: Some(message.into()),
        }
    }

    /// Message id used for the in-progress notification.
    pub fn progress_message_id(run_id: u64) -> String {
        format!("task-run-inprogress-{}", run_id)
    }

    /// Message id used for the terminal result.
    pub fn result_message_id(run_id: u64) -> String {
        format!("task-run-result-{}", run_id)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Lifecycle of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Received,
    InProgress,
    Finished,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }

    /// Move to `next`, rejecting anything that leaves a terminal state or
    /// skips `InProgress`.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        let allowed = matches!(
            (*self, next),
            (JobState::Received, JobState::InProgress)
                | (JobState::InProgress, JobState::Finished)
                | (JobState::InProgress, JobState::Failed)
        );
        if !allowed {
            return Err(TaskError::Other(format!(
                "invalid job transition {:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Registry credential fields recognised in job parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryParams {
    pub github_username: String,
    pub github_token: String,
    pub ecr_account_id: String,
    pub ecr_region: String,
    pub acr_login_server: String,
    pub acr_tenant_id: String,
}

impl RegistryParams {
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let get = |key: &str| params.get(key).cloned().unwrap_or_default();
        Self {
            github_username: get("github_username"),
            github_token: get("github_token"),
            ecr_account_id: get("ecr_account_id"),
            ecr_region: get("ecr_region"),
            acr_login_server: get("acr_login_server"),
            acr_tenant_id: get("acr_tenant_id"),
        }
    }
}

/// Typed view of a scan job's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParams {
    pub artifact_url: String,
    pub registry_type: String,
    pub credentials: RegistryParams,
}

impl ScanParams {
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let artifact_url = params
            .get(PARAM_ARTIFACT_URL)
            .cloned()
            .ok_or_else(|| TaskError::MissingParameter("OCI artifact url".to_string()))?;
        let registry_type = params
            .get(PARAM_REGISTRY_TYPE)
            .cloned()
            .unwrap_or_else(|| DEFAULT_REGISTRY_TYPE.to_string());

        Ok(Self {
            artifact_url,
            registry_type,
            credentials: RegistryParams::from_params(params),
        })
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_request_decode() {
        let request = TaskRequest::from_slice(
            br#"{"runID":42,"params":{"oci_artifact_url":"ghcr.io/example/app:v1.0"}}"#,
        )
        .unwrap();
        assert_eq!(request.run_id, 42);
        assert_eq!(
            request.params.get("oci_artifact_url").map(String::as_str),
            Some("ghcr.io/example/app:v1.0")
        );
    }

    #[test]
    fn test_request_decode_invalid() {
        let err = TaskRequest::from_slice(b"not json").unwrap_err();
        assert!(matches!(err, TaskError::InvalidJob(_)));
    }

    #[test]
    fn test_progress_message_shape() {
        let json: serde_json::Value =
            serde_json::from_slice(&TaskResponse::in_progress(42).to_vec().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"runID": 42, "status": "in-progress"}));
    }

    #[test]
    fn test_failed_message_shape() {
        let response = TaskResponse::failed(7, "OCI artifact url parameter is not provided", None);
        let json: serde_json::Value = serde_json::from_slice(&response.to_vec().unwrap()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(
            json["failureMessage"],
            "OCI artifact url parameter is not provided"
        );
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_finished_result_is_base64() {
        let response = TaskResponse::finished(1, br#"{"matches":[]}"#.to_vec());
        let json: serde_json::Value = serde_json::from_slice(&response.to_vec().unwrap()).unwrap();
        assert_eq!(json["result"], "eyJtYXRjaGVzIjpbXX0=");

        let decoded: TaskResponse = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.result.as_deref(), Some(&br#"{"matches":[]}"#[..]));
    }

    #[test]
    fn test_message_ids() {
        assert_eq!(TaskResponse::progress_message_id(42), "task-run-inprogress-42");
        assert_eq!(TaskResponse::result_message_id(42), "task-run-result-42");
    }

    #[test]
    fn test_state_happy_path() {
        let mut state = JobState::Received;
        state.transition(JobState::InProgress).unwrap();
        state.transition(JobState::Finished).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_state_terminal_is_final() {
        let mut state = JobState::Received;
        state.transition(JobState::InProgress).unwrap();
        state.transition(JobState::Failed).unwrap();
        assert!(state.transition(JobState::InProgress).is_err());
        assert!(state.transition(JobState::Finished).is_err());
        assert_eq!(state, JobState::Failed);
    }

    #[test]
    fn test_state_cannot_skip_in_progress() {
        let mut state = JobState::Received;
        assert!(state.transition(JobState::Finished).is_err());
        assert_eq!(state, JobState::Received);
    }

    #[test]
    fn test_scan_params_defaults_to_ghcr() {
        let p = ScanParams::from_params(&params(&[
            ("oci_artifact_url", "ghcr.io/example/app:v1.0"),
            ("github_username", "u"),
            ("github_token", "t"),
        ]))
        .unwrap();
        assert_eq!(p.registry_type, "ghcr");
        assert_eq!(p.credentials.github_username, "u");
        assert_eq!(p.credentials.github_token, "t");
        assert!(p.credentials.ecr_region.is_empty());
    }

    #[test]
    fn test_scan_params_missing_url() {
        let err = ScanParams::from_params(&params(&[("registry_type", "ecr")])).unwrap_err();
        assert_eq!(err.to_string(), "OCI artifact url parameter is not provided");
    }

    #[test]
    fn test_registry_params_ignores_unknown_keys() {
        let p = RegistryParams::from_params(&params(&[
            ("ecr_account_id", "123456789012"),
            ("ecr_region", "us-east-1"),
            ("something_else", "x"),
        ]));
        assert_eq!(p.ecr_account_id, "123456789012");
        assert_eq!(p.ecr_region, "us-east-1");
        assert_eq!(p.github_username, "");
    }
}
