//! Shared fixtures: a scripted stage client and store helpers
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vulscan_orchestration::{
    Classification, DependencyGraph, EmbeddingImage, NormalizedSource, PipelineWorker,
    RetryPolicy, ScanJob, StageClient, StageFailure, StageFailureKind, StageId, StageParams,
    StageResult, WorkerSettings,
};
use vulscan_storage::{
    FileFindings, FileId, FileRecord, FileStatus, Finding, NewScan, Scan, ScanFile, ScanId,
    ScanResults, ScanStatus, ScanStore, Severity, SqliteScanStore, StorageError, Upload,
    Vulnerability,
};

/// What the mock services do for one file
#[derive(Debug, Clone)]
pub enum Script {
    Clean,
    Vulnerable(Vec<Finding>),
    /// `is_vulnerable=false` alongside a non-empty list
    NotVulnerableWithFindings(Vec<Finding>),
    /// build-image finds no usable nodes
    Placeholder(Vec<Finding>),
    FailAt(StageId, StageFailureKind),
    EmptyGraph,
    Hang(StageId),
    /// Hangs on the first call to the stage only
    HangOnce(StageId),
    /// Cancels the scan from inside classify, then reports the findings
    CancelDuringClassify(Vec<Finding>),
}

pub struct MockStageClient {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<(StageId, String)>>,
    store: Option<Arc<dyn ScanStore>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockStageClient {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            store: None,
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn script(mut self, file_name: &str, script: Script) -> Self {
        self.scripts.insert(file_name.to_string(), script);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ScanStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Per-file latency inside normalize
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<(StageId, String)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, file_name: &str) -> Vec<StageId> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, f)| f == file_name)
            .map(|(s, _)| *s)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, stage: StageId, params: &StageParams) -> Script {
        self.calls.lock().push((stage, params.file_name.clone()));
        self.scripts
            .get(&params.file_name)
            .cloned()
            .unwrap_or(Script::Clean)
    }

    async fn gate(&self, stage: StageId, file_name: &str, script: &Script) -> StageResult<()> {
        match script {
            Script::FailAt(at, kind) if *at == stage => Err(StageFailure::new(
                stage,
                *kind,
                format!("scripted {} failure", stage),
            )),
            Script::Hang(at) if *at == stage => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Script::HangOnce(at) if *at == stage => {
                let attempts = self
                    .calls
                    .lock()
                    .iter()
                    .filter(|(s, f)| *s == stage && f == file_name)
                    .count();
                if attempts == 1 {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StageClient for MockStageClient {
    async fn normalize(&self, source: &Path, params: &StageParams) -> StageResult<NormalizedSource> {
        let script = self.enter(StageId::Normalize, params);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.gate(StageId::Normalize, &params.file_name, &script).await?;
        Ok(NormalizedSource {
            path: params
                .work_dir
                .join(source.file_name().unwrap_or_default()),
        })
    }

    async fn extract_graph(
        &self,
        _normalized: &NormalizedSource,
        params: &StageParams,
    ) -> StageResult<DependencyGraph> {
        let script = self.enter(StageId::ExtractGraph, params);
        self.gate(StageId::ExtractGraph, &params.file_name, &script).await?;

        if matches!(script, Script::EmptyGraph) {
            return Ok(DependencyGraph::new(""));
        }
        Ok(DependencyGraph::new(format!(
            "digraph \"{}\" {{ 1 -> 2; 2 -> 3; }}",
            params.file_name
        )))
    }

    async fn build_image(
        &self,
        _graph: &DependencyGraph,
        params: &StageParams,
    ) -> StageResult<EmbeddingImage> {
        let script = self.enter(StageId::BuildImage, params);
        self.gate(StageId::BuildImage, &params.file_name, &script).await?;

        Ok(EmbeddingImage {
            path: params.artifact_path(StageId::BuildImage, ".pkl"),
            placeholder: matches!(script, Script::Placeholder(_)),
        })
    }

    async fn classify(
        &self,
        _image: &EmbeddingImage,
        params: &StageParams,
    ) -> StageResult<Classification> {
        let script = self.enter(StageId::Classify, params);
        self.gate(StageId::Classify, &params.file_name, &script).await?;

        Ok(match script {
            Script::Vulnerable(findings) | Script::Placeholder(findings) => {
                Classification::vulnerable(findings)
            }
            Script::NotVulnerableWithFindings(findings) => Classification {
                is_vulnerable: false,
                findings,
            },
            Script::CancelDuringClassify(findings) => {
                if let Some(store) = &self.store {
                    store
                        .transition_scan(params.scan_id, ScanStatus::Cancelled)
                        .await
                        .map_err(|e| StageFailure::internal(StageId::Classify, e.to_string()))?;
                }
                Classification::vulnerable(findings)
            }
            _ => Classification::clean(),
        })
    }
}

/// Delegates to SQLite; `record_vulnerability` fails for `poisoned_file`
pub struct FailingStore {
    pub inner: Arc<SqliteScanStore>,
    pub poisoned_file: Mutex<Option<FileId>>,
    pub tripped: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<SqliteScanStore>) -> Self {
        Self {
            inner,
            poisoned_file: Mutex::new(None),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn poison(&self, file_id: FileId) {
        *self.poisoned_file.lock() = Some(file_id);
    }
}

#[async_trait]
impl ScanStore for FailingStore {
    async fn create_files(
        &self,
        project_id: &str,
        uploads: &[Upload],
    ) -> vulscan_storage::Result<Vec<FileRecord>> {
        self.inner.create_files(project_id, uploads).await
    }

    async fn create_scan(&self, new_scan: &NewScan) -> vulscan_storage::Result<Scan> {
        self.inner.create_scan(new_scan).await
    }

    async fn get_scan(&self, scan_id: ScanId) -> vulscan_storage::Result<Scan> {
        self.inner.get_scan(scan_id).await
    }

    async fn get_file(&self, file_id: FileId) -> vulscan_storage::Result<FileRecord> {
        self.inner.get_file(file_id).await
    }

    async fn scan_files(&self, scan_id: ScanId) -> vulscan_storage::Result<Vec<ScanFile>> {
        self.inner.scan_files(scan_id).await
    }

    async fn list_scans(&self, owner_id: &str) -> vulscan_storage::Result<Vec<Scan>> {
        self.inner.list_scans(owner_id).await
    }

    async fn get_results(&self, scan_id: ScanId) -> vulscan_storage::Result<ScanResults> {
        self.inner.get_results(scan_id).await
    }

    async fn transition_scan(
        &self,
        scan_id: ScanId,
        to: ScanStatus,
    ) -> vulscan_storage::Result<Scan> {
        self.inner.transition_scan(scan_id, to).await
    }

    async fn set_file_status(
        &self,
        scan_id: ScanId,
        file_id: FileId,
        status: FileStatus,
    ) -> vulscan_storage::Result<()> {
        self.inner.set_file_status(scan_id, file_id, status).await
    }

    async fn record_vulnerability(
        &self,
        scan_id: ScanId,
        file_id: FileId,
        finding: &Finding,
    ) -> vulscan_storage::Result<Vulnerability> {
        if *self.poisoned_file.lock() == Some(file_id) {
            self.tripped.store(true, Ordering::SeqCst);
            return Err(StorageError::database("disk I/O error"));
        }
        self.inner.record_vulnerability(scan_id, file_id, finding).await
    }

    async fn delete_scan(&self, scan_id: ScanId) -> vulscan_storage::Result<()> {
        self.inner.delete_scan(scan_id).await
    }

    async fn delete_project(&self, project_id: &str) -> vulscan_storage::Result<usize> {
        self.inner.delete_project(project_id).await
    }
}

pub fn finding(function_name: &str, severity: Severity, confidence: f64) -> Finding {
    Finding {
        function_name: function_name.to_string(),
        line_number: 10,
        severity,
        vulnerability_type: "Buffer Overflow".to_string(),
        cwe_id: "CWE-119".to_string(),
        description: "A buffer overflow condition exists".to_string(),
        recommendation: None,
        code_snippet: None,
        confidence,
    }
}

pub fn upload(name: &str) -> Upload {
    Upload::new(name, format!("/srv/uploads/{}", name), 128, "text/x-c")
}

pub fn settings() -> WorkerSettings {
    WorkerSettings {
        stage_timeout: Duration::from_secs(5),
        retry: RetryPolicy::default(),
        file_concurrency: 1,
        work_dir: PathBuf::from("/tmp/vulscan-test-work"),
    }
}

/// Register `names` as files and create a pending scan over them
pub async fn pending_scan(
    store: &dyn ScanStore,
    names: &[&str],
) -> (Scan, Vec<FileRecord>, ScanJob) {
    let uploads: Vec<Upload> = names.iter().map(|n| upload(n)).collect();
    let files = store.create_files("proj-1", &uploads).await.unwrap();
    let scan = store
        .create_scan(&NewScan::new("proj-1", "user-1", files.iter().map(|f| f.id)))
        .await
        .unwrap();
    let job = ScanJob::new(scan.id, files.iter().map(|f| f.id));
    (scan, files, job)
}

pub fn worker(
    store: Arc<SqliteScanStore>,
    client: Arc<MockStageClient>,
    settings: WorkerSettings,
) -> PipelineWorker {
    PipelineWorker::new(store.clone(), store, client, settings)
}

pub fn findings_for<'a>(results: &'a ScanResults, file: &FileRecord) -> &'a [Vulnerability] {
    results.findings_for(file.id)
}

/// Check count invariants against the stored rows
pub fn assert_counts_match(results: &ScanResults) {
    let counts = results.scan.counts;
    assert!(counts.is_consistent(), "inconsistent counts: {:?}", counts);
    assert_eq!(counts.total as usize, results.total_findings());

    let by = |s: Severity| {
        results
            .files
            .iter()
            .flat_map(|f: &FileFindings| f.vulnerabilities.iter())
            .filter(|v| v.finding.severity == s)
            .count() as u32
    };
    assert_eq!(counts.high, by(Severity::High));
    assert_eq!(counts.medium, by(Severity::Medium));
    assert_eq!(counts.low, by(Severity::Low));
}
