//! scantask core - foundational types shared by the runtime, queue and CLI.
//!
//! This crate provides the error taxonomy, the worker configuration, and the
//! job wire types with their lifecycle.

pub mod config;
pub mod error;
pub mod job;

// Re-export commonly used types
pub use config::{ArchiveConfig, QueueConfig, ScannerConfig, WorkerConfig};
pub use error::{Result, TaskError};
pub use job::{JobState, RegistryParams, ScanParams, TaskRequest, TaskResponse, TaskRunStatus};

/// scantask version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
