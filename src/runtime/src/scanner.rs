//! External vulnerability scanner.
//!
//! The scanner is a subprocess that takes a Docker-archive path and prints a
//! JSON report. Only the process boundary lives here; matching is entirely
//! the scanner's business.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scantask_core::config::ScannerConfig;
use scantask_core::error::{Result, TaskError};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Runs a scan over an archive.
#[async_trait]
pub trait ScannerPort: Send + Sync {
    async fn scan(&self, archive: &Path) -> Result<ScanResult>;
}

/// Raw scanner output plus its decoded report.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Machine-readable report as printed on stdout
    pub output: Vec<u8>,
    /// Diagnostics printed on stderr
    pub stderr: Vec<u8>,
    pub report: ScanReport,
}

impl ScanResult {
    /// Decode `stdout` as a report.
    pub fn from_output(stdout: Vec<u8>, stderr: Vec<u8>) -> Result<Self> {
        match serde_json::from_slice::<ScanReport>(&stdout) {
            Ok(report) => Ok(Self {
                output: stdout,
                stderr,
                report,
            }),
            Err(e) => Err(TaskError::ScanOutputDecodeError {
                message: e.to_string(),
                output: combine(&stdout, &stderr),
            }),
        }
    }
}

/// Subset of the grype JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(default)]
    pub matches: Vec<VulnerabilityMatch>,
}

impl ScanReport {
    /// Match count per severity, e.g. `{"Critical": 2, "High": 5}`.
    pub fn severity_summary(&self) -> BTreeMap<String, usize> {
        let mut summary = BTreeMap::new();
        for m in &self.matches {
            let severity = if m.vulnerability.severity.is_empty() {
                "Unknown"
            } else {
                m.vulnerability.severity.as_str()
            };
            *summary.entry(severity.to_string()).or_insert(0) += 1;
        }
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityMatch {
    pub vulnerability: Vulnerability,
    #[serde(default)]
    pub related_vulnerabilities: Vec<RelatedVulnerability>,
    #[serde(default)]
    pub match_details: Vec<serde_json::Value>,
    #[serde(default)]
    pub artifact: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub id: String,
    #[serde(default)]
    pub data_source: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cvss: Vec<serde_json::Value>,
    #[serde(default)]
    pub fix: Fix,
    #[serde(default)]
    pub advisories: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedVulnerability {
    pub id: String,
    #[serde(default)]
    pub data_source: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub severity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub state: String,
}

/// Scanner backed by the `grype` executable.
#[derive(Debug, Clone)]
pub struct GrypeScanner {
    binary: PathBuf,
    output_format: String,
}

impl GrypeScanner {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            output_format: config.output_format.clone(),
        }
    }
}

#[async_trait]
impl ScannerPort for GrypeScanner {
    async fn scan(&self, archive: &Path) -> Result<ScanResult> {
        tracing::info!(
            scanner = %self.binary.display(),
            archive = %archive.display(),
            "Scanning archive"
        );

        let output = Command::new(&self.binary)
            .arg(archive)
            .arg("-o")
            .arg(&self.output_format)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TaskError::ScanExecutionError {
                message: format!("failed to run {}: {}", self.binary.display(), e),
                output: Vec::new(),
            })?;

        tracing::debug!(
            status = %output.status,
            stdout_bytes = output.stdout.len(),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Scanner finished"
        );

        if !output.status.success() {
            return Err(TaskError::ScanExecutionError {
                message: format!("{} exited with {}", self.binary.display(), output.status),
                output: combine(&output.stdout, &output.stderr),
            });
        }

        let result = ScanResult::from_output(output.stdout, output.stderr)?;
        tracing::info!(
            matches = result.report.matches.len(),
            severities = ?result.report.severity_summary(),
            "Scan complete"
        );
        Ok(result)
    }
}

fn combine(stdout: &[u8], stderr: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(stdout.len() + stderr.len());
    out.extend_from_slice(stdout);
    out.extend_from_slice(stderr);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "matches": [
            {
                "vulnerability": {
                    "id": "CVE-2023-0001",
                    "dataSource": "https://nvd.nist.gov/vuln/detail/CVE-2023-0001",
                    "namespace": "nvd:cpe",
                    "severity": "High",
                    "urls": ["https://example.com/CVE-2023-0001"],
                    "cvss": [{"version": "3.1", "metrics": {"baseScore": 7.5}}],
                    "fix": {"versions": ["1.2.3"], "state": "fixed"}
                },
                "relatedVulnerabilities": [{"id": "GHSA-xxxx", "namespace": "github:language:go"}],
                "matchDetails": [{"type": "exact-direct-match"}],
                "artifact": {"name": "openssl", "version": "1.1.1"}
            },
            {"vulnerability": {"id": "CVE-2023-0002", "severity": "High"}},
            {"vulnerability": {"id": "CVE-2023-0003", "severity": "Critical"}},
            {"vulnerability": {"id": "CVE-2023-0004"}}
        ],
        "source": {"type": "image"},
        "descriptor": {"name": "grype"}
    }"#;

    #[test]
    fn test_decode_report() {
        let result = ScanResult::from_output(REPORT.as_bytes().to_vec(), Vec::new()).unwrap();
        let first = &result.report.matches[0];
        assert_eq!(first.vulnerability.id, "CVE-2023-0001");
        assert_eq!(first.vulnerability.fix.versions, vec!["1.2.3"]);
        assert_eq!(first.vulnerability.fix.state, "fixed");
        assert_eq!(first.related_vulnerabilities[0].id, "GHSA-xxxx");
        assert_eq!(result.output, REPORT.as_bytes());
    }

    #[test]
    fn test_severity_summary() {
        let result = ScanResult::from_output(REPORT.as_bytes().to_vec(), Vec::new()).unwrap();
        let summary = result.report.severity_summary();
        assert_eq!(summary.get("High"), Some(&2));
        assert_eq!(summary.get("Critical"), Some(&1));
        assert_eq!(summary.get("Unknown"), Some(&1));
    }

    #[test]
    fn test_empty_report() {
        let result = ScanResult::from_output(br#"{"matches":[]}"#.to_vec(), Vec::new())
            .unwrap();
        assert!(result.report.matches.is_empty());
        assert!(result.report.severity_summary().is_empty());
    }

    #[test]
    fn test_malformed_output_keeps_raw_bytes() {
        let err = ScanResult::from_output(b"not json".to_vec(), b"warn: db stale".to_vec())
            .unwrap_err();
        assert!(matches!(err, TaskError::ScanOutputDecodeError { .. }));
        assert_eq!(err.scanner_output(), Some(&b"not jsonwarn: db stale"[..]));
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-grype");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn scanner(binary: PathBuf) -> GrypeScanner {
        GrypeScanner::new(&ScannerConfig {
            binary,
            ..Default::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_receives_archive_and_format() {
        let dir = tempfile::TempDir::new().unwrap();
        let bin = script(
            dir.path(),
            r#"printf '{"matches":[],"args":"%s %s %s"}' "$1" "$2" "$3""#,
        );

        let result = scanner(bin).scan(Path::new("/work/image.tar")).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&result.output).unwrap();
        assert_eq!(doc["args"], "/work/image.tar -o json");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let bin = script(dir.path(), "echo 'failed to load image' >&2; exit 1");

        let err = scanner(bin).scan(Path::new("image.tar")).await.unwrap_err();
        assert!(matches!(err, TaskError::ScanExecutionError { .. }));
        let output = String::from_utf8_lossy(err.scanner_output().unwrap()).into_owned();
        assert!(output.contains("failed to load image"));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let s = GrypeScanner::new(&ScannerConfig {
            binary: PathBuf::from("/nonexistent/grype-binary"),
            ..Default::default()
        });
        let err = s.scan(Path::new("image.tar")).await.unwrap_err();
        assert!(matches!(err, TaskError::ScanExecutionError { .. }));
    }
}
