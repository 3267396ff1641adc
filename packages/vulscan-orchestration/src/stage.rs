//! Stage client contract
//!
//! Each of the four analysis stages is an external service consumed as
//! "send input, receive a typed payload or a `StageFailure`". Failures are
//! values, never errors: the worker branches on them and skips the file.

use crate::error::ErrorCategory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use vulscan_storage::{FileId, FileRecord, Finding, ScanId};

/// Stage identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    Normalize,
    ExtractGraph,
    BuildImage,
    Classify,
}

impl StageId {
    /// Fixed chain order; each stage consumes the previous stage's output
    pub const CHAIN: [StageId; 4] = [
        StageId::Normalize,
        StageId::ExtractGraph,
        StageId::BuildImage,
        StageId::Classify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Normalize => "normalize",
            StageId::ExtractGraph => "extract-graph",
            StageId::BuildImage => "build-image",
            StageId::Classify => "classify",
        }
    }

    pub fn next(&self) -> Option<StageId> {
        match self {
            StageId::Normalize => Some(StageId::ExtractGraph),
            StageId::ExtractGraph => Some(StageId::BuildImage),
            StageId::BuildImage => Some(StageId::Classify),
            StageId::Classify => None,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normalize" => Ok(StageId::Normalize),
            "extract-graph" => Ok(StageId::ExtractGraph),
            "build-image" => Ok(StageId::BuildImage),
            "classify" => Ok(StageId::Classify),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Failures
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFailureKind {
    /// Transport error or per-call timeout
    Unreachable,
    /// The service refused the input (4xx, missing or malformed input)
    RejectedInput,
    /// The service failed (5xx, undecodable response)
    InternalError,
}

impl StageFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageFailureKind::Unreachable => "unreachable",
            StageFailureKind::RejectedInput => "rejected_input",
            StageFailureKind::InternalError => "internal_error",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            StageFailureKind::Unreachable | StageFailureKind::InternalError => {
                ErrorCategory::Transient
            }
            StageFailureKind::RejectedInput => ErrorCategory::Permanent,
        }
    }
}

impl fmt::Display for StageFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: StageId,
    pub kind: StageFailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: StageId, kind: StageFailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageFailureKind::Unreachable, message)
    }

    pub fn rejected(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageFailureKind::RejectedInput, message)
    }

    pub fn internal(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageFailureKind::InternalError, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.category().is_retryable()
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.stage, self.kind, self.message)
    }
}

pub type StageResult<T> = std::result::Result<T, StageFailure>;

// ═══════════════════════════════════════════════════════════════════════════
// Payloads
// ═══════════════════════════════════════════════════════════════════════════

/// Output of `normalize`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedSource {
    pub path: PathBuf,
}

/// Output of `extract-graph`: graph description text (DOT)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub data: String,
}

impl DependencyGraph {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.data.trim().is_empty()
    }
}

/// Output of `build-image`: handle to the three centrality-weighted channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingImage {
    pub path: PathBuf,
    /// Single zero-vector channels, produced when the graph had no usable nodes
    #[serde(default)]
    pub placeholder: bool,
}

/// Output of `classify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub is_vulnerable: bool,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl Classification {
    pub fn clean() -> Self {
        Self {
            is_vulnerable: false,
            findings: Vec::new(),
        }
    }

    pub fn vulnerable(findings: Vec<Finding>) -> Self {
        Self {
            is_vulnerable: true,
            findings,
        }
    }
}

/// Per-call parameters: which file of which scan, and where intermediate
/// artifacts go
#[derive(Debug, Clone)]
pub struct StageParams {
    pub scan_id: ScanId,
    pub file_id: FileId,
    pub file_name: String,
    pub work_dir: PathBuf,
}

/// Reduce an uploaded name to a single path component: separators and
/// whitespace become `_`, anything outside `[A-Za-z0-9._-]` is dropped, and
/// leading/trailing `.` and `_` are trimmed. May return an empty string.
pub fn secure_file_name(name: &str) -> String {
    let joined = name
        .split(|c: char| c == '/' || c == '\\' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect::<String>()
        .trim_matches(|c| c == '.' || c == '_')
        .to_string()
}

impl StageParams {
    /// `file_name` is re-sanitized so artifact paths stay under `work_dir`
    /// even for records that bypassed the dispatcher
    pub fn new(scan_id: ScanId, file: &FileRecord, work_dir: &Path) -> Self {
        let file_name = match secure_file_name(&file.filename) {
            name if name.is_empty() => "upload".to_string(),
            name => name,
        };
        Self {
            scan_id,
            file_id: file.id,
            file_name,
            work_dir: work_dir.to_path_buf(),
        }
    }

    /// `<work_dir>/<scan_id>/<stage>/<file_id>-<file_name><suffix>`
    pub fn artifact_path(&self, stage: StageId, suffix: &str) -> PathBuf {
        self.work_dir
            .join(self.scan_id.to_string())
            .join(stage.as_str())
            .join(format!("{}-{}{}", self.file_id, self.file_name, suffix))
    }
}

/// Uniform request shape for `StageClient::invoke`
#[derive(Debug, Clone)]
pub enum StageRequest {
    Normalize { source: PathBuf },
    ExtractGraph { normalized: NormalizedSource },
    BuildImage { graph: DependencyGraph },
    Classify { image: EmbeddingImage },
}

impl StageRequest {
    pub fn stage(&self) -> StageId {
        match self {
            StageRequest::Normalize { .. } => StageId::Normalize,
            StageRequest::ExtractGraph { .. } => StageId::ExtractGraph,
            StageRequest::BuildImage { .. } => StageId::BuildImage,
            StageRequest::Classify { .. } => StageId::Classify,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Normalized(NormalizedSource),
    Graph(DependencyGraph),
    Image(EmbeddingImage),
    Classification(Classification),
}

// ═══════════════════════════════════════════════════════════════════════════
// Client trait
// ═══════════════════════════════════════════════════════════════════════════

/// Stage client (injected into the worker; one long-lived instance)
#[async_trait]
pub trait StageClient: Send + Sync {
    async fn normalize(&self, source: &Path, params: &StageParams) -> StageResult<NormalizedSource>;

    async fn extract_graph(
        &self,
        normalized: &NormalizedSource,
        params: &StageParams,
    ) -> StageResult<DependencyGraph>;

    async fn build_image(
        &self,
        graph: &DependencyGraph,
        params: &StageParams,
    ) -> StageResult<EmbeddingImage>;

    async fn classify(
        &self,
        image: &EmbeddingImage,
        params: &StageParams,
    ) -> StageResult<Classification>;

    /// Liveness check for one stage service
    async fn health(&self, _stage: StageId) -> StageResult<()> {
        Ok(())
    }

    /// Dispatch a tagged request to the matching stage
    async fn invoke(&self, request: StageRequest, params: &StageParams) -> StageResult<StageOutput> {
        match request {
            StageRequest::Normalize { source } => self
                .normalize(&source, params)
                .await
                .map(StageOutput::Normalized),
            StageRequest::ExtractGraph { normalized } => self
                .extract_graph(&normalized, params)
                .await
                .map(StageOutput::Graph),
            StageRequest::BuildImage { graph } => self
                .build_image(&graph, params)
                .await
                .map(StageOutput::Image),
            StageRequest::Classify { image } => self
                .classify(&image, params)
                .await
                .map(StageOutput::Classification),
        }
    }
}
