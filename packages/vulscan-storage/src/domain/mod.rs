//! Domain layer for the scan store
//!
//! # Domain Models
//!
//! - `Scan`: one vulnerability-scan job over a fixed snapshot of files
//! - `FileRecord`: an uploaded artifact, owned by a project
//! - `Vulnerability`: one finding, created only while a scan is processed
//! - `PdgArtifact`: serialized dependency graph for a (scan, file) pair
//!
//! # Port Traits
//!
//! - `ScanStore`: scan/file/vulnerability records and the status state machine
//! - `ArtifactStore`: derived artifacts, at most one PDG per (scan, file)
//!
//! # Examples
//!
//! ```rust,ignore
//! use vulscan_storage::domain::{ScanStore, ScanStatus, NewScan};
//!
//! async fn example(store: impl ScanStore) -> Result<()> {
//!     let files = store.create_files("project-1", &uploads).await?;
//!     let scan = store
//!         .create_scan(&NewScan::new("project-1", "user-1", files.iter().map(|f| f.id)))
//!         .await?;
//!
//!     // Only legal moves of the state machine succeed
//!     store.transition_scan(scan.id, ScanStatus::Processing).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Result, StorageError};

pub type ScanId = Uuid;
pub type FileId = Uuid;

/// Opaque key/value scan configuration
pub type ScanOptions = BTreeMap<String, serde_json::Value>;

// ═══════════════════════════════════════════════════════════════════════════
// Scan Status State Machine
// ═══════════════════════════════════════════════════════════════════════════

/// Scan lifecycle status
///
/// ```text
/// pending ──▶ processing ──▶ completed
///    │            │  └─────▶ failed
///    └────────────┴────────▶ cancelled
/// ```
///
/// `completed`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub const ALL: [ScanStatus; 5] = [
        ScanStatus::Pending,
        ScanStatus::Processing,
        ScanStatus::Completed,
        ScanStatus::Failed,
        ScanStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Processing => "processing",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal move
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Pending, Cancelled)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "processing" => Ok(ScanStatus::Processing),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            "cancelled" => Ok(ScanStatus::Cancelled),
            _ => Err(StorageError::serialization(format!(
                "Invalid scan status: {}",
                s
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Severity & Counts
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            _ => Err(StorageError::serialization(format!(
                "Invalid severity: {}",
                s
            ))),
        }
    }
}

/// Per-scan tally of findings by severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounts {
    pub total: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl ScanCounts {
    pub fn record(&mut self, severity: Severity) {
        self.total += 1;
        match severity {
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    /// `high + medium + low == total`
    pub fn is_consistent(&self) -> bool {
        self.high + self.medium + self.low == self.total
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: ScanId,
    pub project_id: String,
    pub owner_id: String,
    pub status: ScanStatus,
    #[serde(default)]
    pub options: ScanOptions,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: ScanCounts,
}

/// Input for `ScanStore::create_scan`: the scan plus its fixed file snapshot
#[derive(Debug, Clone)]
pub struct NewScan {
    pub project_id: String,
    pub owner_id: String,
    pub options: ScanOptions,
    pub file_ids: Vec<FileId>,
}

impl NewScan {
    pub fn new(
        project_id: impl Into<String>,
        owner_id: impl Into<String>,
        file_ids: impl IntoIterator<Item = FileId>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            owner_id: owner_id.into(),
            options: ScanOptions::new(),
            file_ids: file_ids.into_iter().collect(),
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }
}

/// An upload already written to storage, not yet registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub filename: String,
    pub storage_path: PathBuf,
    pub size: u64,
    pub content_type: String,
}

impl Upload {
    pub fn new(
        filename: impl Into<String>,
        storage_path: impl Into<PathBuf>,
        size: u64,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            storage_path: storage_path.into(),
            size,
            content_type: content_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub project_id: String,
    pub filename: String,
    pub storage_path: PathBuf,
    pub size: u64,
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Per-scan processing status of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    NotStarted,
    Succeeded,
    SkippedFailed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::NotStarted => "not_started",
            FileStatus::Succeeded => "succeeded",
            FileStatus::SkippedFailed => "skipped_failed",
        }
    }
}

impl FromStr for FileStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_started" => Ok(FileStatus::NotStarted),
            "succeeded" => Ok(FileStatus::Succeeded),
            "skipped_failed" => Ok(FileStatus::SkippedFailed),
            _ => Err(StorageError::serialization(format!(
                "Invalid file status: {}",
                s
            ))),
        }
    }
}

/// A file as seen from one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFile {
    pub file: FileRecord,
    pub status: FileStatus,
}

/// One classifier finding, before it is attached to a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub function_name: String,
    pub line_number: u32,
    pub severity: Severity,
    pub vulnerability_type: String,
    pub cwe_id: String,
    pub description: String,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub code_snippet: Option<String>,
    /// Classifier confidence in `0.0..=1.0`
    pub confidence: f64,
}

impl Finding {
    /// Confidence clamped into `0.0..=1.0` (NaN becomes 0)
    pub fn clamped_confidence(&self) -> f64 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }
}

/// Immutable stored finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: Uuid,
    pub scan_id: ScanId,
    pub file_id: FileId,
    #[serde(flatten)]
    pub finding: Finding,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdgArtifact {
    pub id: Uuid,
    pub scan_id: ScanId,
    pub file_id: FileId,
    /// Graph description text (DOT)
    pub graph_data: String,
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFindings {
    pub file: FileRecord,
    pub vulnerabilities: Vec<Vulnerability>,
}

/// Scan plus its findings grouped by file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResults {
    pub scan: Scan,
    pub files: Vec<FileFindings>,
}

impl ScanResults {
    pub fn total_findings(&self) -> usize {
        self.files.iter().map(|f| f.vulnerabilities.len()).sum()
    }

    pub fn findings_for(&self, file_id: FileId) -> &[Vulnerability] {
        self.files
            .iter()
            .find(|f| f.file.id == file_id)
            .map(|f| f.vulnerabilities.as_slice())
            .unwrap_or(&[])
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Traits
// ═══════════════════════════════════════════════════════════════════════════

/// Scan, file and vulnerability records (the state tracker)
#[async_trait]
pub trait ScanStore: Send + Sync {
    // ═══════════════════════════════════════════════════════════════════════
    // Creation
    // ═══════════════════════════════════════════════════════════════════════

    async fn create_files(&self, project_id: &str, uploads: &[Upload]) -> Result<Vec<FileRecord>>;

    /// Create a `pending` scan and its file snapshot in one transaction
    async fn create_scan(&self, new_scan: &NewScan) -> Result<Scan>;

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    async fn get_scan(&self, scan_id: ScanId) -> Result<Scan>;

    async fn get_file(&self, file_id: FileId) -> Result<FileRecord>;

    /// Files of a scan, in submission order
    async fn scan_files(&self, scan_id: ScanId) -> Result<Vec<ScanFile>>;

    /// Scans of an owner, newest first
    async fn list_scans(&self, owner_id: &str) -> Result<Vec<Scan>>;

    async fn get_results(&self, scan_id: ScanId) -> Result<ScanResults>;

    // ═══════════════════════════════════════════════════════════════════════
    // Updates
    // ═══════════════════════════════════════════════════════════════════════

    /// Move the scan to `to` if the state machine allows it from the
    /// current status; terminal statuses stamp `completed_at`.
    async fn transition_scan(&self, scan_id: ScanId, to: ScanStatus) -> Result<Scan>;

    async fn set_file_status(
        &self,
        scan_id: ScanId,
        file_id: FileId,
        status: FileStatus,
    ) -> Result<()>;

    /// Insert the finding and bump the scan counters as one atomic write.
    async fn record_vulnerability(
        &self,
        scan_id: ScanId,
        file_id: FileId,
        finding: &Finding,
    ) -> Result<Vulnerability>;

    // ═══════════════════════════════════════════════════════════════════════
    // Deletion (cascades to vulnerabilities and artifacts)
    // ═══════════════════════════════════════════════════════════════════════

    async fn delete_scan(&self, scan_id: ScanId) -> Result<()>;

    /// Returns the number of scans removed
    async fn delete_project(&self, project_id: &str) -> Result<usize>;
}

/// Derived artifacts (the result store)
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// At most once per (scan, file); a second call fails with
    /// `DuplicateArtifact` and leaves the first artifact untouched.
    async fn save_pdg(
        &self,
        scan_id: ScanId,
        file_id: FileId,
        graph_data: &str,
    ) -> Result<PdgArtifact>;

    async fn get_pdg(&self, scan_id: ScanId, file_id: FileId) -> Result<PdgArtifact>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_legal_transitions() {
        use ScanStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));
    }

    #[test]
    fn test_illegal_transitions() {
        use ScanStatus::*;

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_status_roundtrip() {
        for status in ScanStatus::ALL {
            assert_eq!(status.as_str().parse::<ScanStatus>().unwrap(), status);
        }
        assert!("running".parse::<ScanStatus>().is_err());
    }

    fn any_status() -> impl Strategy<Value = ScanStatus> {
        prop::sample::select(ScanStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_terminal_status_has_no_exit(from in any_status(), to in any_status()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        #[test]
        fn prop_only_pending_enters_processing(from in any_status()) {
            prop_assert_eq!(
                from.can_transition_to(ScanStatus::Processing),
                from == ScanStatus::Pending
            );
        }

        #[test]
        fn prop_counts_stay_consistent(severities in prop::collection::vec(0u8..3, 0..64)) {
            let mut counts = ScanCounts::default();
            for s in &severities {
                counts.record(match s {
                    0 => Severity::High,
                    1 => Severity::Medium,
                    _ => Severity::Low,
                });
            }
            prop_assert!(counts.is_consistent());
            prop_assert_eq!(counts.total as usize, severities.len());
        }
    }

    #[test]
    fn test_severity_parse_is_case_insensitive() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!("low".parse::<Severity>().unwrap(), Severity::Low);
        assert!("critical".parse::<Severity>().is_err());
    }

    #[test]
    fn test_finding_confidence_clamped() {
        let mut finding = Finding {
            function_name: "main".to_string(),
            line_number: 3,
            severity: Severity::Low,
            vulnerability_type: "Resource Leak".to_string(),
            cwe_id: "CWE-772".to_string(),
            description: "leak".to_string(),
            recommendation: None,
            code_snippet: None,
            confidence: 1.7,
        };
        assert_eq!(finding.clamped_confidence(), 1.0);

        finding.confidence = f64::NAN;
        assert_eq!(finding.clamped_confidence(), 0.0);
    }

    #[test]
    fn test_vulnerability_serde_flattens_finding() {
        let vuln = Vulnerability {
            id: Uuid::new_v4(),
            scan_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            finding: Finding {
                function_name: "copy".to_string(),
                line_number: 12,
                severity: Severity::High,
                vulnerability_type: "Buffer Overflow".to_string(),
                cwe_id: "CWE-119".to_string(),
                description: "overflow".to_string(),
                recommendation: Some("check bounds".to_string()),
                code_snippet: None,
                confidence: 0.93,
            },
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&vuln).unwrap();
        assert_eq!(json["severity"], "high");
        assert_eq!(json["cwe_id"], "CWE-119");

        let back: Vulnerability = serde_json::from_value(json).unwrap();
        assert_eq!(back, vuln);
    }
}
