//! Pipeline worker
//!
//! Runs every file of a scan through `normalize -> extract-graph ->
//! build-image -> classify`. A stage failure skips that file only; a store
//! failure ends the scan as `failed`. Before each file the scan status is
//! re-read and processing stops once the scan has been cancelled.

use crate::error::{OrchestratorError, Result};
use crate::job::ScanJob;
use crate::stage::{StageClient, StageFailure, StageId, StageParams, StageResult};
use crate::stages::RetryPolicy;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vulscan_storage::{
    ArtifactStore, FileId, FileRecord, FileStatus, ScanId, ScanStatus, ScanStore, StorageError,
};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Upper bound for each attempt of a stage call; expiry counts as
    /// `unreachable` and is retried like any transient failure
    pub stage_timeout: Duration,
    pub retry: RetryPolicy,
    pub file_concurrency: usize,
    pub work_dir: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            file_concurrency: 1,
            work_dir: PathBuf::from("vulscan-work"),
        }
    }
}

/// Summary of one `process_scan` run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    pub scan_id: ScanId,
    pub status: ScanStatus,
    pub files_succeeded: usize,
    pub files_skipped: usize,
    pub files_not_started: usize,
    pub vulnerabilities_recorded: usize,
    pub duration_ms: u64,
    /// Set when the scan ended `failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a file's chain stopped
enum ChainError {
    /// Absorbed by the skip policy
    Stage(StageFailure),
    /// Ends the scan
    Fatal(OrchestratorError),
}

impl From<StageFailure> for ChainError {
    fn from(failure: StageFailure) -> Self {
        ChainError::Stage(failure)
    }
}

impl From<StorageError> for ChainError {
    fn from(err: StorageError) -> Self {
        ChainError::Fatal(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileResult {
    Succeeded { vulnerabilities: usize },
    Skipped,
    /// Scan was cancelled before this file started
    NotStarted,
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    skipped: usize,
    vulnerabilities: usize,
    cancelled: bool,
}

impl Tally {
    fn add(&mut self, result: FileResult) {
        match result {
            FileResult::Succeeded { vulnerabilities } => {
                self.succeeded += 1;
                self.vulnerabilities += vulnerabilities;
            }
            FileResult::Skipped => self.skipped += 1,
            FileResult::NotStarted => self.cancelled = true,
        }
    }
}

pub struct PipelineWorker {
    scans: Arc<dyn ScanStore>,
    artifacts: Arc<dyn ArtifactStore>,
    client: Arc<dyn StageClient>,
    settings: WorkerSettings,
    worker_id: String,
}

impl PipelineWorker {
    pub fn new(
        scans: Arc<dyn ScanStore>,
        artifacts: Arc<dyn ArtifactStore>,
        client: Arc<dyn StageClient>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            scans,
            artifacts,
            client,
            settings,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Process one scan job
    ///
    /// Returns `Err` only when the scan cannot be claimed (unknown scan, or
    /// not `pending`, e.g. a duplicate delivery). Every later failure is
    /// reported through the outcome's terminal status.
    pub async fn process_scan(&self, job: &ScanJob) -> Result<ScanOutcome> {
        let scan_id = job.scan_id;
        let start_time = Instant::now();

        // Claim: pending -> processing, at most once per scan
        self.scans
            .transition_scan(scan_id, ScanStatus::Processing)
            .await?;

        info!(
            scan_id = %scan_id,
            worker_id = %self.worker_id,
            files = job.file_ids.len(),
            "Scan claimed"
        );

        let file_ids = dedup(&job.file_ids);
        let total = file_ids.len();

        let tally = match self.run_files(scan_id, file_ids).await {
            Ok(tally) => tally,
            Err(e) => return Ok(self.fail_scan(scan_id, e, total, start_time).await),
        };

        let status = if tally.cancelled {
            ScanStatus::Cancelled
        } else {
            match self.finish_scan(scan_id).await {
                Ok(status) => status,
                Err(e) => return Ok(self.fail_scan(scan_id, e, total, start_time).await),
            }
        };

        let outcome = ScanOutcome {
            scan_id,
            status,
            files_succeeded: tally.succeeded,
            files_skipped: tally.skipped,
            files_not_started: total - tally.succeeded - tally.skipped,
            vulnerabilities_recorded: tally.vulnerabilities,
            duration_ms: start_time.elapsed().as_millis() as u64,
            error: None,
        };

        info!(
            scan_id = %scan_id,
            status = %outcome.status,
            succeeded = outcome.files_succeeded,
            skipped = outcome.files_skipped,
            not_started = outcome.files_not_started,
            vulnerabilities = outcome.vulnerabilities_recorded,
            "Scan finished in {}ms",
            outcome.duration_ms
        );

        Ok(outcome)
    }

    /// Resolve the job's files against the scan snapshot and run them
    async fn run_files(&self, scan_id: ScanId, file_ids: Vec<FileId>) -> Result<Tally> {
        let mut snapshot: HashMap<FileId, FileRecord> = self
            .scans
            .scan_files(scan_id)
            .await?
            .into_iter()
            .map(|sf| (sf.file.id, sf.file))
            .collect();

        let mut tally = Tally::default();
        let mut files = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            match snapshot.remove(&file_id) {
                Some(file) => files.push(file),
                None => {
                    warn!(
                        scan_id = %scan_id,
                        file_id = %file_id,
                        "File has no record in this scan, skipping"
                    );
                    tally.skipped += 1;
                }
            }
        }

        let concurrency = self.settings.file_concurrency.max(1);
        let mut results = stream::iter(files)
            .map(|file| self.run_file(scan_id, file))
            .buffer_unordered(concurrency);

        // Dropping the stream on a fatal error abandons in-flight files
        while let Some(result) = results.next().await {
            tally.add(result?);
        }

        Ok(tally)
    }

    async fn run_file(&self, scan_id: ScanId, file: FileRecord) -> Result<FileResult> {
        let scan = self.scans.get_scan(scan_id).await?;
        if scan.status == ScanStatus::Cancelled {
            debug!(scan_id = %scan_id, file_id = %file.id, "Scan cancelled, not starting file");
            return Ok(FileResult::NotStarted);
        }

        match self.process_file(scan_id, &file).await {
            Ok(vulnerabilities) => {
                self.scans
                    .set_file_status(scan_id, file.id, FileStatus::Succeeded)
                    .await?;
                debug!(
                    scan_id = %scan_id,
                    file_id = %file.id,
                    vulnerabilities,
                    "File processed"
                );
                Ok(FileResult::Succeeded { vulnerabilities })
            }
            Err(ChainError::Stage(failure)) => {
                warn!(
                    scan_id = %scan_id,
                    file_id = %file.id,
                    file_name = %file.filename,
                    stage = %failure.stage,
                    failure_kind = %failure.kind,
                    "Skipping file: {}",
                    failure.message
                );
                self.scans
                    .set_file_status(scan_id, file.id, FileStatus::SkippedFailed)
                    .await?;
                Ok(FileResult::Skipped)
            }
            Err(ChainError::Fatal(e)) => Err(e),
        }
    }

    /// The four-stage chain for one file; returns the number of findings recorded
    async fn process_file(
        &self,
        scan_id: ScanId,
        file: &FileRecord,
    ) -> std::result::Result<usize, ChainError> {
        let params = StageParams::new(scan_id, file, &self.settings.work_dir);

        let normalized = self
            .call_stage(StageId::Normalize, &params, || {
                self.client.normalize(&file.storage_path, &params)
            })
            .await?;
        if normalized.path.as_os_str().is_empty() {
            return Err(StageFailure::internal(StageId::Normalize, "Empty normalized path").into());
        }

        let graph = self
            .call_stage(StageId::ExtractGraph, &params, || {
                self.client.extract_graph(&normalized, &params)
            })
            .await?;
        if graph.is_empty() {
            return Err(
                StageFailure::internal(StageId::ExtractGraph, "Empty dependency graph").into(),
            );
        }

        self.artifacts
            .save_pdg(scan_id, file.id, &graph.data)
            .await?;

        let image = self
            .call_stage(StageId::BuildImage, &params, || {
                self.client.build_image(&graph, &params)
            })
            .await?;
        if image.placeholder {
            debug!(
                scan_id = %scan_id,
                file_id = %file.id,
                "No usable graph nodes, classifying placeholder image"
            );
        }

        let classification = self
            .call_stage(StageId::Classify, &params, || {
                self.client.classify(&image, &params)
            })
            .await?;
        if !classification.is_vulnerable {
            return Ok(0);
        }

        for finding in &classification.findings {
            self.scans
                .record_vulnerability(scan_id, file.id, finding)
                .await?;
        }

        Ok(classification.findings.len())
    }

    /// One stage call: every attempt gets the full `stage_timeout`
    async fn call_stage<T, F, Fut>(
        &self,
        stage: StageId,
        params: &StageParams,
        call: F,
    ) -> StageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StageResult<T>>,
    {
        self.settings
            .retry
            .run(stage, Some(params), Some(self.settings.stage_timeout), call)
            .await
    }

    /// processing -> completed, unless a cancel got there first
    async fn finish_scan(&self, scan_id: ScanId) -> Result<ScanStatus> {
        match self
            .scans
            .transition_scan(scan_id, ScanStatus::Completed)
            .await
        {
            Ok(scan) => Ok(scan.status),
            Err(e) if e.is_invalid_transition() => {
                let scan = self.scans.get_scan(scan_id).await?;
                info!(
                    scan_id = %scan_id,
                    status = %scan.status,
                    "Scan left processing before completion"
                );
                Ok(scan.status)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_scan(
        &self,
        scan_id: ScanId,
        cause: OrchestratorError,
        total: usize,
        start_time: Instant,
    ) -> ScanOutcome {
        error!(
            scan_id = %scan_id,
            category = %cause.category(),
            "Scan failed: {}",
            cause
        );

        let status = match self.scans.transition_scan(scan_id, ScanStatus::Failed).await {
            Ok(scan) => scan.status,
            Err(e) => {
                error!(scan_id = %scan_id, "Could not mark scan failed: {}", e);
                self.scans
                    .get_scan(scan_id)
                    .await
                    .map(|scan| scan.status)
                    .unwrap_or(ScanStatus::Failed)
            }
        };

        let (succeeded, skipped) = match self.scans.scan_files(scan_id).await {
            Ok(files) => (
                files
                    .iter()
                    .filter(|f| f.status == FileStatus::Succeeded)
                    .count(),
                files
                    .iter()
                    .filter(|f| f.status == FileStatus::SkippedFailed)
                    .count(),
            ),
            Err(_) => (0, 0),
        };

        let vulnerabilities = self
            .scans
            .get_scan(scan_id)
            .await
            .map(|scan| scan.counts.total as usize)
            .unwrap_or(0);

        ScanOutcome {
            scan_id,
            status,
            files_succeeded: succeeded,
            files_skipped: skipped,
            files_not_started: total.saturating_sub(succeeded + skipped),
            vulnerabilities_recorded: vulnerabilities,
            duration_ms: start_time.elapsed().as_millis() as u64,
            error: Some(cause.to_string()),
        }
    }
}

/// Keep the first occurrence of each id
fn dedup(file_ids: &[FileId]) -> Vec<FileId> {
    let mut seen = HashSet::with_capacity(file_ids.len());
    file_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}
