use thiserror::Error;
use vulscan_storage::{ErrorKind, StorageError};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Persistence error: {0}")]
    Storage(StorageError),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Scan not found: {0}")]
    ScanNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Duplicate artifact: {0}")]
    DuplicateArtifact(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn invalid_request<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidRequest(e.to_string())
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, OrchestratorError::InvalidTransition { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ScanNotFound(_)
                | OrchestratorError::FileNotFound(_)
                | OrchestratorError::ArtifactNotFound(_)
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Http(_) => ErrorCategory::Transient,
            OrchestratorError::Storage(_) | OrchestratorError::Io(_) => {
                ErrorCategory::Infrastructure
            }
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Storage kinds map onto the orchestrator's error vocabulary; everything
/// without a dedicated variant is a persistence failure.
impl From<StorageError> for OrchestratorError {
    fn from(err: StorageError) -> Self {
        match err.kind {
            ErrorKind::InvalidTransition => match err.transition {
                Some((from, to)) => OrchestratorError::InvalidTransition { from, to },
                None => OrchestratorError::Storage(err),
            },
            ErrorKind::ScanNotFound => OrchestratorError::ScanNotFound(err.message),
            ErrorKind::ArtifactNotFound => OrchestratorError::ArtifactNotFound(err.message),
            ErrorKind::FileNotFound => OrchestratorError::FileNotFound(err.message),
            ErrorKind::DuplicateArtifact => OrchestratorError::DuplicateArtifact(err.message),
            _ => OrchestratorError::Storage(err),
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, connection)
    Transient,
    /// Permanent error - don't retry (e.g., invalid input, parse error)
    Permanent,
    /// Infrastructure error - fatal to the running scan (e.g., store down)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        *self == ErrorCategory::Transient
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
