use thiserror::Error;

/// Scan task error types
#[derive(Error, Debug)]
pub enum TaskError {
    /// Artifact reference could not be parsed
    #[error("Invalid artifact reference: {0}")]
    InvalidReference(String),

    /// Registry kind is not one of ghcr, ecr, acr
    #[error("Unsupported registry type: {0}")]
    UnsupportedRegistry(String),

    /// A required credential field is empty
    #[error("{registry} requires {fields}")]
    MissingCredential { registry: String, fields: String },

    /// Cloud token issuance or OAuth exchange failed
    #[error("{provider} authentication failed: {message}")]
    AuthProviderError { provider: String, message: String },

    /// The credential map holds nothing for the host being pulled from
    #[error("No credentials for host {0}")]
    NoCredentialForHost(String),

    /// Transport, auth, or not-found failure while talking to a registry
    #[error("Registry error: {registry} - {message}")]
    RegistryFetchError { registry: String, message: String },

    /// Top-level manifest is not valid JSON of the expected shape
    #[error("Failed to decode manifest: {0}")]
    ManifestDecodeError(String),

    /// Descriptor media type is outside the allow-list
    #[error("Unsupported media type {media_type} for {digest}")]
    UnsupportedMediaType { media_type: String, digest: String },

    /// Blob missing from the content store or unreadable
    #[error("Failed to fetch blob {digest}: {message}")]
    BlobFetchError { digest: String, message: String },

    /// Scanner exited unsuccessfully or could not be spawned
    #[error("Scanner failed: {message}")]
    ScanExecutionError { message: String, output: Vec<u8> },

    /// Scanner output is not the expected JSON document
    #[error("Failed to decode scanner output: {message}")]
    ScanOutputDecodeError { message: String, output: Vec<u8> },

    /// Progress or result message could not be published
    #[error("Failed to publish message {message_id}: {message}")]
    QueuePublishError { message_id: String, message: String },

    /// Required job parameter is absent
    #[error("{0} parameter is not provided")]
    MissingParameter(String),

    /// Job payload could not be decoded
    #[error("Invalid job message: {0}")]
    InvalidJob(String),

    /// Queue consume, ack, or lease failure
    #[error("Queue error: {0}")]
    QueueError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl TaskError {
    /// Captured scanner output carried by scan failures.
    pub fn scanner_output(&self) -> Option<&[u8]> {
        match self {
            TaskError::ScanExecutionError { output, .. }
            | TaskError::ScanOutputDecodeError { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::SerializationError(err.to_string())
    }
}

/// Result type alias for scan task operations
pub type Result<T> = std::result::Result<T, TaskError>;
