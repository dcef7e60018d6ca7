use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TaskError};

/// Worker configuration, built once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Queue connection and topology
    pub queue: QueueConfig,

    /// External scanner invocation
    pub scanner: ScannerConfig,

    /// Archive assembly policy
    pub archive: ArchiveConfig,

    /// Root under which a fresh directory is created per job
    pub work_dir: PathBuf,

    /// Lease renewal interval in seconds
    pub lease_renewal_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            scanner: ScannerConfig::default(),
            archive: ArchiveConfig::default(),
            work_dir: std::env::temp_dir(),
            lease_renewal_secs: 15,
        }
    }
}

impl WorkerConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| TaskError::ConfigError(format!("{} is not set", key)))
        };

        let defaults = Self::default();
        let queue = QueueConfig {
            url: required("NATS_URL")?,
            consumer: required("NATS_CONSUMER")?,
            stream_name: required("NATS_STREAM_NAME")?,
            topic: required("NATS_TOPIC_NAME")?,
            result_topic: required("NATS_RESULT_TOPIC_NAME")?,
            ack_wait_secs: parse_or(&lookup, "ACK_WAIT_SECS", defaults.queue.ack_wait_secs)?,
            inactive_threshold_secs: parse_or(
                &lookup,
                "CONSUMER_INACTIVE_THRESHOLD_SECS",
                defaults.queue.inactive_threshold_secs,
            )?,
            stream_max_messages: parse_or(
                &lookup,
                "STREAM_MAX_MESSAGES",
                defaults.queue.stream_max_messages,
            )?,
        };

        let scanner = ScannerConfig {
            binary: lookup("SCANNER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.scanner.binary),
            ..defaults.scanner
        };

        let archive = ArchiveConfig {
            include_oci_manifest: parse_or(
                &lookup,
                "ARCHIVE_INCLUDE_OCI_MANIFEST",
                defaults.archive.include_oci_manifest,
            )?,
            remove_intermediate: parse_or(
                &lookup,
                "ARCHIVE_REMOVE_INTERMEDIATE",
                defaults.archive.remove_intermediate,
            )?,
        };

        let lease_renewal_secs = parse_or(
            &lookup,
            "LEASE_RENEWAL_INTERVAL_SECS",
            defaults.lease_renewal_secs,
        )?;
        if lease_renewal_secs == 0 {
            return Err(TaskError::ConfigError(
                "LEASE_RENEWAL_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            queue,
            scanner,
            archive,
            work_dir: lookup("SCANTASK_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            lease_renewal_secs,
        })
    }

    pub fn lease_renewal_interval(&self) -> Duration {
        Duration::from_secs(self.lease_renewal_secs)
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Server URL
    pub url: String,

    /// Durable consumer name
    pub consumer: String,

    /// Stream holding both job and result subjects
    pub stream_name: String,

    /// Subject jobs are consumed from
    pub topic: String,

    /// Subject progress and results are published to
    pub result_topic: String,

    /// How long a delivered message may stay unacknowledged
    pub ack_wait_secs: u64,

    /// Idle time after which the server may drop the consumer
    pub inactive_threshold_secs: u64,

    /// Stream retention limit
    pub stream_max_messages: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            consumer: "scantask".to_string(),
            stream_name: "scantask".to_string(),
            topic: "scantask.jobs".to_string(),
            result_topic: "scantask.results".to_string(),
            ack_wait_secs: 30 * 60,
            inactive_threshold_secs: 60 * 60,
            stream_max_messages: 100,
        }
    }
}

/// Scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Scanner executable
    pub binary: PathBuf,

    /// Value passed to the scanner's output flag
    pub output_format: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("grype"),
            output_format: "json".to_string(),
        }
    }
}

/// Archive assembly policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Add the raw OCI manifest to the archive for provenance
    pub include_oci_manifest: bool,

    /// Delete loose manifest files once the tar is sealed
    pub remove_intermediate: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            include_oci_manifest: true,
            remove_intermediate: true,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| TaskError::ConfigError(format!("invalid {}: {}", key, e))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base_env() -> HashMap<String, String> {
        env(&[
            ("NATS_URL", "nats://queue:4222"),
            ("NATS_CONSUMER", "grype-worker"),
            ("NATS_STREAM_NAME", "tasks"),
            ("NATS_TOPIC_NAME", "tasks.grype"),
            ("NATS_RESULT_TOPIC_NAME", "tasks.grype.result"),
        ])
    }

    #[test]
    fn test_from_lookup_defaults() {
        let vars = base_env();
        let config = WorkerConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.queue.url, "nats://queue:4222");
        assert_eq!(config.queue.consumer, "grype-worker");
        assert_eq!(config.queue.result_topic, "tasks.grype.result");
        assert_eq!(config.queue.ack_wait_secs, 1800);
        assert_eq!(config.queue.inactive_threshold_secs, 3600);
        assert_eq!(config.lease_renewal_interval(), Duration::from_secs(15));
        assert_eq!(config.scanner.binary, PathBuf::from("grype"));
        assert!(config.archive.include_oci_manifest);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let mut vars = base_env();
        vars.insert("SCANNER_PATH".to_string(), "/usr/local/bin/grype".to_string());
        vars.insert("LEASE_RENEWAL_INTERVAL_SECS".to_string(), "5".to_string());
        vars.insert("ARCHIVE_REMOVE_INTERMEDIATE".to_string(), "false".to_string());
        vars.insert("SCANTASK_WORK_DIR".to_string(), "/var/lib/scantask".to_string());

        let config = WorkerConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.scanner.binary, PathBuf::from("/usr/local/bin/grype"));
        assert_eq!(config.lease_renewal_secs, 5);
        assert!(!config.archive.remove_intermediate);
        assert_eq!(config.work_dir, PathBuf::from("/var/lib/scantask"));
    }

    #[test]
    fn test_from_lookup_missing_required() {
        let mut vars = base_env();
        vars.remove("NATS_TOPIC_NAME");
        let err = WorkerConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, TaskError::ConfigError(_)));
        assert!(err.to_string().contains("NATS_TOPIC_NAME"));
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let mut vars = base_env();
        vars.insert("ACK_WAIT_SECS".to_string(), "soon".to_string());
        let err = WorkerConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains("ACK_WAIT_SECS"));
    }

    #[test]
    fn test_zero_renewal_interval_rejected() {
        let mut vars = base_env();
        vars.insert("LEASE_RENEWAL_INTERVAL_SECS".to_string(), "0".to_string());
        assert!(WorkerConfig::from_lookup(|k| vars.get(k).cloned()).is_err());
    }
}
