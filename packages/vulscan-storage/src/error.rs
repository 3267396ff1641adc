//! Error types for vulscan-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// Scan not found
    ScanNotFound,
    /// File not found
    FileNotFound,
    /// PDG artifact not found
    ArtifactNotFound,
    /// Scan status move not allowed by the state machine
    InvalidTransition,
    /// PDG artifact already stored for (scan, file)
    DuplicateArtifact,
    /// Transaction errors
    Transaction,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::ScanNotFound => "scan_not_found",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::ArtifactNotFound => "artifact_not_found",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::DuplicateArtifact => "duplicate_artifact",
            ErrorKind::Transaction => "transaction",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
    /// `(from, to)` for `InvalidTransition`
    pub transition: Option<(String, String)>,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            transition: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn scan_not_found(scan_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ScanNotFound,
            format!("Scan not found: {}", scan_id),
        )
    }

    pub fn file_not_found(file_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::FileNotFound,
            format!("File not found: {}", file_id),
        )
    }

    pub fn artifact_not_found(scan_id: impl fmt::Display, file_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ArtifactNotFound,
            format!("PDG not found for scan {} file {}", scan_id, file_id),
        )
    }

    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        let (from, to) = (from.to_string(), to.to_string());
        let mut err = Self::new(
            ErrorKind::InvalidTransition,
            format!("Invalid scan transition: {} -> {}", from, to),
        );
        err.transition = Some((from, to));
        err
    }

    pub fn duplicate_artifact(scan_id: impl fmt::Display, file_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::DuplicateArtifact,
            format!("PDG already stored for scan {} file {}", scan_id, file_id),
        )
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ScanNotFound | ErrorKind::FileNotFound | ErrorKind::ArtifactNotFound
        )
    }

    pub fn is_invalid_transition(&self) -> bool {
        self.kind == ErrorKind::InvalidTransition
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("I/O error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = StorageError::scan_not_found("abc123");
        let msg = format!("{}", err);
        assert!(msg.contains("scan_not_found"));
        assert!(msg.contains("abc123"));
    }

    #[test]
    fn test_database_error() {
        let err = StorageError::database("Connection failed");
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.source.is_none());
        assert_eq!(format!("{}", err), "[database] Connection failed");
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = StorageError::invalid_transition("completed", "processing");
        assert!(err.is_invalid_transition());
        assert_eq!(
            err.transition,
            Some(("completed".to_string(), "processing".to_string()))
        );
        assert_eq!(
            format!("{}", err),
            "[invalid_transition] Invalid scan transition: completed -> processing"
        );
    }

    #[test]
    fn test_not_found_family() {
        assert!(StorageError::scan_not_found("s").is_not_found());
        assert!(StorageError::file_not_found("f").is_not_found());
        assert!(StorageError::artifact_not_found("s", "f").is_not_found());
        assert!(!StorageError::duplicate_artifact("s", "f").is_not_found());
    }

    #[test]
    fn test_with_source() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = StorageError::database("DB file missing").with_source(io_err);

        let source = err.source().unwrap();
        assert!(source.to_string().contains("file not found"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_from_rusqlite_error() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();

        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.message.contains("SQLite error"));
        assert!(err.source.is_some());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json")
            .err()
            .unwrap();
        let err: StorageError = json_err.into();

        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.contains("JSON error"));
    }
}
