//! SQLite adapter for ScanStore / ArtifactStore
//!
//! One connection behind a mutex. Every multi-statement write runs in a
//! transaction, so status compare-and-set and the vulnerability/counter
//! pair are observed together or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    ArtifactStore, FileFindings, FileId, FileRecord, FileStatus, Finding, NewScan, PdgArtifact,
    Scan, ScanCounts, ScanFile, ScanId, ScanOptions, ScanResults, ScanStatus, ScanStore,
    Severity, Upload, Vulnerability,
};
use crate::{Result, StorageError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS files (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        storage_path TEXT NOT NULL,
        size INTEGER NOT NULL,
        content_type TEXT NOT NULL,
        uploaded_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_files_project ON files(project_id);

    CREATE TABLE IF NOT EXISTS scans (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        status TEXT NOT NULL,
        options TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        claimed_at TEXT,
        total_count INTEGER NOT NULL DEFAULT 0,
        high_count INTEGER NOT NULL DEFAULT 0,
        medium_count INTEGER NOT NULL DEFAULT 0,
        low_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_scans_owner ON scans(owner_id, started_at);
    CREATE INDEX IF NOT EXISTS idx_scans_project ON scans(project_id);

    CREATE TABLE IF NOT EXISTS scan_files (
        scan_id TEXT NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
        file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'not_started',
        PRIMARY KEY (scan_id, file_id)
    );

    CREATE TABLE IF NOT EXISTS vulnerabilities (
        id TEXT PRIMARY KEY,
        scan_id TEXT NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
        file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        function_name TEXT NOT NULL,
        line_number INTEGER NOT NULL,
        severity TEXT NOT NULL,
        vulnerability_type TEXT NOT NULL,
        cwe_id TEXT NOT NULL,
        description TEXT NOT NULL,
        recommendation TEXT,
        code_snippet TEXT,
        confidence REAL NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_vulns_scan_file ON vulnerabilities(scan_id, file_id);

    CREATE TABLE IF NOT EXISTS pdgs (
        id TEXT PRIMARY KEY,
        scan_id TEXT NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
        file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        graph_data TEXT NOT NULL,
        image_ref TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (scan_id, file_id)
    );
";

const SCAN_COLUMNS: &str = "id, project_id, owner_id, status, options, started_at, completed_at, \
     total_count, high_count, medium_count, low_count";

const FILE_COLUMNS: &str =
    "id, project_id, filename, storage_path, size, content_type, uploaded_at";

/// SQLite-based scan store
#[derive(Clone)]
pub struct SqliteScanStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteScanStore {
    /// Open (or create) a store at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// In-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside a transaction; dropped (rolled back) on error
    fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| StorageError::transaction(format!("commit failed: {}", e)).with_source(e))?;
        Ok(value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<Scan> {
    let raw_options: String = row.get(4)?;
    let options: ScanOptions = serde_json::from_str(&raw_options)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(Scan {
        id: parsed(row, 0)?,
        project_id: row.get(1)?,
        owner_id: row.get(2)?,
        status: parsed(row, 3)?,
        options,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        counts: ScanCounts {
            total: row.get(7)?,
            high: row.get(8)?,
            medium: row.get(9)?,
            low: row.get(10)?,
        },
    })
}

/// File columns starting at `offset`
fn file_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: parsed(row, offset)?,
        project_id: row.get(offset + 1)?,
        filename: row.get(offset + 2)?,
        storage_path: parsed(row, offset + 3)?,
        size: row.get(offset + 4)?,
        content_type: row.get(offset + 5)?,
        uploaded_at: row.get(offset + 6)?,
    })
}

fn vulnerability_from_row(row: &Row<'_>) -> rusqlite::Result<Vulnerability> {
    Ok(Vulnerability {
        id: parsed(row, 0)?,
        scan_id: parsed(row, 1)?,
        file_id: parsed(row, 2)?,
        finding: Finding {
            function_name: row.get(3)?,
            line_number: row.get(4)?,
            severity: parsed(row, 5)?,
            vulnerability_type: row.get(6)?,
            cwe_id: row.get(7)?,
            description: row.get(8)?,
            recommendation: row.get(9)?,
            code_snippet: row.get(10)?,
            confidence: row.get(11)?,
        },
        created_at: row.get(12)?,
    })
}

fn pdg_from_row(row: &Row<'_>) -> rusqlite::Result<PdgArtifact> {
    Ok(PdgArtifact {
        id: parsed(row, 0)?,
        scan_id: parsed(row, 1)?,
        file_id: parsed(row, 2)?,
        graph_data: row.get(3)?,
        image_ref: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn load_scan(conn: &Connection, scan_id: ScanId) -> Result<Scan> {
    conn.query_row(
        &format!("SELECT {} FROM scans WHERE id = ?1", SCAN_COLUMNS),
        params![scan_id.to_string()],
        scan_from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::scan_not_found(scan_id))
}

fn load_status(conn: &Connection, scan_id: ScanId) -> Result<ScanStatus> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM scans WHERE id = ?1",
            params![scan_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => raw.parse(),
        None => Err(StorageError::scan_not_found(scan_id)),
    }
}

fn was_claimed(conn: &Connection, scan_id: ScanId) -> Result<bool> {
    let claimed_at: Option<DateTime<Utc>> = conn.query_row(
        "SELECT claimed_at FROM scans WHERE id = ?1",
        params![scan_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(claimed_at.is_some())
}

fn counter_column(severity: Severity) -> &'static str {
    match severity {
        Severity::High => "high_count",
        Severity::Medium => "medium_count",
        Severity::Low => "low_count",
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ScanStore
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl ScanStore for SqliteScanStore {
    async fn create_files(&self, project_id: &str, uploads: &[Upload]) -> Result<Vec<FileRecord>> {
        self.with_tx(|tx| {
            let now = Utc::now();
            let mut records = Vec::with_capacity(uploads.len());

            for upload in uploads {
                let record = FileRecord {
                    id: Uuid::new_v4(),
                    project_id: project_id.to_string(),
                    filename: upload.filename.clone(),
                    storage_path: upload.storage_path.clone(),
                    size: upload.size,
                    content_type: upload.content_type.clone(),
                    uploaded_at: now,
                };
                tx.execute(
                    &format!(
                        "INSERT INTO files ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        FILE_COLUMNS
                    ),
                    params![
                        record.id.to_string(),
                        &record.project_id,
                        &record.filename,
                        record.storage_path.to_string_lossy(),
                        record.size,
                        &record.content_type,
                        record.uploaded_at,
                    ],
                )?;
                records.push(record);
            }

            Ok(records)
        })
    }

    async fn create_scan(&self, new_scan: &NewScan) -> Result<Scan> {
        let options = serde_json::to_string(&new_scan.options)?;

        self.with_tx(|tx| {
            let scan = Scan {
                id: Uuid::new_v4(),
                project_id: new_scan.project_id.clone(),
                owner_id: new_scan.owner_id.clone(),
                status: ScanStatus::Pending,
                options: new_scan.options.clone(),
                started_at: Utc::now(),
                completed_at: None,
                counts: ScanCounts::default(),
            };

            tx.execute(
                "INSERT INTO scans (id, project_id, owner_id, status, options, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    scan.id.to_string(),
                    &scan.project_id,
                    &scan.owner_id,
                    scan.status.as_str(),
                    &options,
                    scan.started_at,
                ],
            )?;

            for (position, file_id) in new_scan.file_ids.iter().enumerate() {
                let owner: Option<String> = tx
                    .query_row(
                        "SELECT project_id FROM files WHERE id = ?1",
                        params![file_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                match owner {
                    Some(ref project) if project == &scan.project_id => {}
                    Some(project) => {
                        return Err(StorageError::file_not_found(format!(
                            "{} (belongs to project {}, not {})",
                            file_id, project, scan.project_id
                        )))
                    }
                    None => return Err(StorageError::file_not_found(file_id)),
                }

                tx.execute(
                    "INSERT INTO scan_files (scan_id, file_id, position, status)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        scan.id.to_string(),
                        file_id.to_string(),
                        position as i64,
                        FileStatus::NotStarted.as_str(),
                    ],
                )?;
            }

            debug!(
                scan_id = %scan.id,
                files = new_scan.file_ids.len(),
                "scan created"
            );
            Ok(scan)
        })
    }

    async fn get_scan(&self, scan_id: ScanId) -> Result<Scan> {
        let conn = self.conn.lock();
        load_scan(&conn, scan_id)
    }

    async fn get_file(&self, file_id: FileId) -> Result<FileRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS),
            params![file_id.to_string()],
            |row| file_from_row(row, 0),
        )
        .optional()?
        .ok_or_else(|| StorageError::file_not_found(file_id))
    }

    async fn scan_files(&self, scan_id: ScanId) -> Result<Vec<ScanFile>> {
        let conn = self.conn.lock();
        load_status(&conn, scan_id)?;

        let mut stmt = conn.prepare(
            "SELECT f.id, f.project_id, f.filename, f.storage_path, f.size, f.content_type,
                    f.uploaded_at, sf.status
             FROM scan_files sf JOIN files f ON f.id = sf.file_id
             WHERE sf.scan_id = ?1
             ORDER BY sf.position",
        )?;
        let files = stmt
            .query_map(params![scan_id.to_string()], |row| {
                Ok(ScanFile {
                    file: file_from_row(row, 0)?,
                    status: parsed(row, 7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    async fn list_scans(&self, owner_id: &str) -> Result<Vec<Scan>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scans WHERE owner_id = ?1 ORDER BY started_at DESC, rowid DESC",
            SCAN_COLUMNS
        ))?;
        let scans = stmt
            .query_map(params![owner_id], scan_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(scans)
    }

    async fn get_results(&self, scan_id: ScanId) -> Result<ScanResults> {
        let conn = self.conn.lock();
        let scan = load_scan(&conn, scan_id)?;

        let mut stmt = conn.prepare(
            "SELECT v.id, v.scan_id, v.file_id, v.function_name, v.line_number, v.severity,
                    v.vulnerability_type, v.cwe_id, v.description, v.recommendation,
                    v.code_snippet, v.confidence, v.created_at,
                    f.id, f.project_id, f.filename, f.storage_path, f.size, f.content_type,
                    f.uploaded_at
             FROM vulnerabilities v
             JOIN files f ON f.id = v.file_id
             LEFT JOIN scan_files sf ON sf.scan_id = v.scan_id AND sf.file_id = v.file_id
             WHERE v.scan_id = ?1
             ORDER BY sf.position, v.line_number, v.rowid",
        )?;
        let rows = stmt
            .query_map(params![scan_id.to_string()], |row| {
                Ok((vulnerability_from_row(row)?, file_from_row(row, 13)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut files: Vec<FileFindings> = Vec::new();
        for (vulnerability, file) in rows {
            match files.last_mut() {
                Some(group) if group.file.id == file.id => group.vulnerabilities.push(vulnerability),
                _ => files.push(FileFindings {
                    file,
                    vulnerabilities: vec![vulnerability],
                }),
            }
        }

        Ok(ScanResults { scan, files })
    }

    async fn transition_scan(&self, scan_id: ScanId, to: ScanStatus) -> Result<Scan> {
        self.with_tx(|tx| {
            let from = load_status(tx, scan_id)?;
            if !from.can_transition_to(to) {
                return Err(StorageError::invalid_transition(from, to));
            }

            let now = Utc::now();
            let completed_at: Option<DateTime<Utc>> = to.is_terminal().then_some(now);
            let claimed_at: Option<DateTime<Utc>> = (to == ScanStatus::Processing).then_some(now);
            let updated = tx.execute(
                "UPDATE scans
                 SET status = ?1,
                     completed_at = COALESCE(?2, completed_at),
                     claimed_at = COALESCE(?3, claimed_at)
                 WHERE id = ?4 AND status = ?5",
                params![
                    to.as_str(),
                    completed_at,
                    claimed_at,
                    scan_id.to_string(),
                    from.as_str()
                ],
            )?;
            if updated != 1 {
                return Err(StorageError::invalid_transition(from, to));
            }

            debug!(scan_id = %scan_id, from = %from, to = %to, "scan transitioned");
            load_scan(tx, scan_id)
        })
    }

    async fn set_file_status(
        &self,
        scan_id: ScanId,
        file_id: FileId,
        status: FileStatus,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE scan_files SET status = ?1 WHERE scan_id = ?2 AND file_id = ?3",
            params![status.as_str(), scan_id.to_string(), file_id.to_string()],
        )?;
        if updated == 0 {
            return Err(StorageError::file_not_found(format!(
                "{} (not part of scan {})",
                file_id, scan_id
            )));
        }
        Ok(())
    }

    async fn record_vulnerability(
        &self,
        scan_id: ScanId,
        file_id: FileId,
        finding: &Finding,
    ) -> Result<Vulnerability> {
        self.with_tx(|tx| {
            // A file already in flight when a cancel lands may still report;
            // a scan cancelled before any worker claimed it may not
            let status = load_status(tx, scan_id)?;
            let accepts = match status {
                ScanStatus::Processing => true,
                ScanStatus::Cancelled => was_claimed(tx, scan_id)?,
                _ => false,
            };
            if !accepts {
                return Err(StorageError::invalid_transition(
                    status,
                    "record_vulnerability",
                ));
            }

            let in_scan: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM scan_files WHERE scan_id = ?1 AND file_id = ?2",
                    params![scan_id.to_string(), file_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if in_scan.is_none() {
                return Err(StorageError::file_not_found(format!(
                    "{} (not part of scan {})",
                    file_id, scan_id
                )));
            }

            let mut stored = finding.clone();
            stored.confidence = finding.clamped_confidence();
            let vulnerability = Vulnerability {
                id: Uuid::new_v4(),
                scan_id,
                file_id,
                finding: stored,
                created_at: Utc::now(),
            };

            let f = &vulnerability.finding;
            tx.execute(
                "INSERT INTO vulnerabilities (id, scan_id, file_id, function_name, line_number,
                     severity, vulnerability_type, cwe_id, description, recommendation,
                     code_snippet, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    vulnerability.id.to_string(),
                    scan_id.to_string(),
                    file_id.to_string(),
                    &f.function_name,
                    f.line_number,
                    f.severity.as_str(),
                    &f.vulnerability_type,
                    &f.cwe_id,
                    &f.description,
                    &f.recommendation,
                    &f.code_snippet,
                    f.confidence,
                    vulnerability.created_at,
                ],
            )?;

            let column = counter_column(f.severity);
            tx.execute(
                &format!(
                    "UPDATE scans SET total_count = total_count + 1, {col} = {col} + 1
                     WHERE id = ?1",
                    col = column
                ),
                params![scan_id.to_string()],
            )?;

            Ok(vulnerability)
        })
    }

    async fn delete_scan(&self, scan_id: ScanId) -> Result<()> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM scans WHERE id = ?1",
            params![scan_id.to_string()],
        )?;
        if deleted == 0 {
            return Err(StorageError::scan_not_found(scan_id));
        }
        Ok(())
    }

    async fn delete_project(&self, project_id: &str) -> Result<usize> {
        self.with_tx(|tx| {
            let scans = tx.execute("DELETE FROM scans WHERE project_id = ?1", params![project_id])?;
            let files = tx.execute("DELETE FROM files WHERE project_id = ?1", params![project_id])?;
            debug!(project_id, scans, files, "project deleted");
            Ok(scans)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ArtifactStore
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl ArtifactStore for SqliteScanStore {
    async fn save_pdg(
        &self,
        scan_id: ScanId,
        file_id: FileId,
        graph_data: &str,
    ) -> Result<PdgArtifact> {
        self.with_tx(|tx| {
            load_status(tx, scan_id)?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM pdgs WHERE scan_id = ?1 AND file_id = ?2",
                    params![scan_id.to_string(), file_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(StorageError::duplicate_artifact(scan_id, file_id));
            }

            let artifact = PdgArtifact {
                id: Uuid::new_v4(),
                scan_id,
                file_id,
                graph_data: graph_data.to_string(),
                image_ref: None,
                created_at: Utc::now(),
            };
            tx.execute(
                "INSERT INTO pdgs (id, scan_id, file_id, graph_data, image_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    artifact.id.to_string(),
                    scan_id.to_string(),
                    file_id.to_string(),
                    &artifact.graph_data,
                    &artifact.image_ref,
                    artifact.created_at,
                ],
            )?;
            Ok(artifact)
        })
    }

    async fn get_pdg(&self, scan_id: ScanId, file_id: FileId) -> Result<PdgArtifact> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, scan_id, file_id, graph_data, image_ref, created_at
             FROM pdgs WHERE scan_id = ?1 AND file_id = ?2",
            params![scan_id.to_string(), file_id.to_string()],
            pdg_from_row,
        )
        .optional()?
        .ok_or_else(|| StorageError::artifact_not_found(scan_id, file_id))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
