/*
 * Vulscan Orchestration - scan pipeline worker
 *
 * Drives uploaded C/C++ sources through four external analysis services
 * (normalize, extract-graph, build-image, classify) and records the
 * findings per scan.
 *
 * Architecture:
 * - Job Dispatcher (creates scans, enqueues jobs)
 * - Job Queue (at-least-once hand-off)
 * - Worker Pool (one task per scan, optional concurrency cap)
 * - Pipeline Worker (per-file stage chain, skip-on-failure)
 * - Stage Clients (HTTP, retry wrapper)
 */

// Public modules
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod pool;
pub mod queue;
pub mod stage;
pub mod stages;
pub mod worker;

// Re-exports
pub use config::{StageEndpoints, WorkerConfig};
pub use dispatcher::{JobDispatcher, Submission};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use job::ScanJob;
pub use pool::{PoolStats, WorkerPool};
pub use queue::{InMemoryJobQueue, JobQueue};
pub use stage::{
    Classification, DependencyGraph, EmbeddingImage, NormalizedSource, StageClient, StageFailure,
    StageFailureKind, StageId, StageOutput, StageParams, StageRequest, StageResult,
};
pub use stages::{HttpStageClient, RetryPolicy, RetryingStageClient, VulnerabilityCatalog};
pub use worker::{PipelineWorker, ScanOutcome, WorkerSettings};
