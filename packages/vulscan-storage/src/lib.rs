//! ScanStore - persistent records for vulnerability scans
//!
//! ## Core Principles
//!
//! 1. **Status-gated transitions**: a scan only moves along the
//!    `pending → processing → {completed, failed}` / `→ cancelled` machine,
//!    enforced as a compare-and-set on the stored status
//! 2. **Atomic counters**: a vulnerability and its severity increment are
//!    written in one transaction
//! 3. **Write-once artifacts**: at most one PDG per (scan, file)
//! 4. **Cascade delete**: vulnerabilities and artifacts die with their scan
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vulscan_storage::{SqliteScanStore, ScanStore, ArtifactStore, NewScan, ScanStatus};
//!
//! let store = SqliteScanStore::in_memory()?;
//! let files = store.create_files("project-1", &uploads).await?;
//! let scan = store
//!     .create_scan(&NewScan::new("project-1", "user-1", files.iter().map(|f| f.id)))
//!     .await?;
//!
//! store.transition_scan(scan.id, ScanStatus::Processing).await?;
//! store.save_pdg(scan.id, files[0].id, "digraph { }").await?;
//! store.record_vulnerability(scan.id, files[0].id, &finding).await?;
//! store.transition_scan(scan.id, ScanStatus::Completed).await?;
//!
//! let results = store.get_results(scan.id).await?;
//! ```

pub mod domain;
pub mod error;

#[cfg(feature = "sqlite")]
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    ArtifactStore, FileFindings, FileId, FileRecord, FileStatus, Finding, NewScan, PdgArtifact,
    Scan, ScanCounts, ScanFile, ScanId, ScanOptions, ScanResults, ScanStatus, ScanStore,
    Severity, Upload, Vulnerability,
};

#[cfg(feature = "sqlite")]
pub use infrastructure::sqlite::SqliteScanStore;
