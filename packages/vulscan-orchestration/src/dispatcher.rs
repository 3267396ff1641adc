use crate::error::{OrchestratorError, Result};
use crate::job::ScanJob;
use crate::queue::JobQueue;
use crate::stage::secure_file_name;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use vulscan_storage::{FileRecord, NewScan, Scan, ScanId, ScanOptions, ScanStatus, ScanStore, Upload};

/// Result of `JobDispatcher::submit`
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub scan: Scan,
    pub files: Vec<FileRecord>,
}

/// Creates scans and hands them to the worker pool
pub struct JobDispatcher {
    scans: Arc<dyn ScanStore>,
    queue: Arc<dyn JobQueue>,
}

impl JobDispatcher {
    pub fn new(scans: Arc<dyn ScanStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { scans, queue }
    }

    /// Register the uploads, create a `pending` scan over them, then enqueue
    /// one job. The job is enqueued only after both records are committed.
    ///
    /// Filenames are reduced to a safe base name; uploads left without one
    /// are ignored.
    pub async fn submit(
        &self,
        project_id: &str,
        owner_id: &str,
        uploads: Vec<Upload>,
        options: ScanOptions,
    ) -> Result<Submission> {
        let total = uploads.len();
        let uploads: Vec<Upload> = uploads
            .into_iter()
            .filter_map(|mut u| {
                u.filename = secure_file_name(&u.filename);
                (!u.filename.is_empty()).then_some(u)
            })
            .collect();

        if uploads.len() < total {
            warn!(
                project_id,
                ignored = total - uploads.len(),
                "Ignoring uploads without a filename"
            );
        }
        if uploads.is_empty() {
            return Err(OrchestratorError::invalid_request("No files to scan"));
        }

        let files = self.scans.create_files(project_id, &uploads).await?;
        let new_scan =
            NewScan::new(project_id, owner_id, files.iter().map(|f| f.id)).with_options(options);
        let scan = self.scans.create_scan(&new_scan).await?;

        self.queue
            .enqueue(ScanJob::new(scan.id, new_scan.file_ids))
            .await?;

        info!(
            scan_id = %scan.id,
            project_id,
            owner_id,
            files = files.len(),
            "Scan submitted"
        );

        Ok(Submission { scan, files })
    }

    /// Honored only while the scan is `pending` or `processing`
    pub async fn cancel(&self, scan_id: ScanId) -> Result<Scan> {
        let scan = self
            .scans
            .transition_scan(scan_id, ScanStatus::Cancelled)
            .await?;

        info!(scan_id = %scan_id, "Scan cancelled");
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use vulscan_storage::SqliteScanStore;

    fn dispatcher() -> (JobDispatcher, Arc<SqliteScanStore>, Arc<InMemoryJobQueue>) {
        let store = Arc::new(SqliteScanStore::in_memory().unwrap());
        let queue = Arc::new(InMemoryJobQueue::new());
        (JobDispatcher::new(store.clone(), queue.clone()), store, queue)
    }

    fn upload(name: &str) -> Upload {
        Upload::new(name, format!("/uploads/{}", name), 64, "text/x-c")
    }

    #[tokio::test]
    async fn test_submit_creates_pending_scan_and_enqueues() {
        let (dispatcher, store, queue) = dispatcher();

        let submission = dispatcher
            .submit(
                "proj-1",
                "user-1",
                vec![upload("a.c"), upload("b.c")],
                ScanOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(submission.scan.status, ScanStatus::Pending);
        assert_eq!(submission.files.len(), 2);
        assert_eq!(queue.len(), 1);

        let job = queue.dequeue().await.unwrap();
        assert_eq!(job.scan_id, submission.scan.id);
        assert_eq!(
            job.file_ids,
            submission.files.iter().map(|f| f.id).collect::<Vec<_>>()
        );

        // Records resolvable by the time the job is visible
        let stored = store.get_scan(job.scan_id).await.unwrap();
        assert_eq!(stored.project_id, "proj-1");
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_upload_set() {
        let (dispatcher, _store, queue) = dispatcher();

        let err = dispatcher
            .submit("proj-1", "user-1", vec![upload("  ")], ScanOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_submit_skips_unnamed_uploads() {
        let (dispatcher, _store, _queue) = dispatcher();

        let submission = dispatcher
            .submit(
                "proj-1",
                "user-1",
                vec![upload(""), upload("main.c")],
                ScanOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(submission.files.len(), 1);
        assert_eq!(submission.files[0].filename, "main.c");
    }

    #[tokio::test]
    async fn test_submit_strips_path_from_filenames() {
        let (dispatcher, store, _queue) = dispatcher();

        let submission = dispatcher
            .submit(
                "proj-1",
                "user-1",
                vec![upload("../../../../etc/cron.d/x"), upload("../..")],
                ScanOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(submission.files.len(), 1);
        assert_eq!(submission.files[0].filename, "etc_cron.d_x");
        let stored = store.get_file(submission.files[0].id).await.unwrap();
        assert_eq!(stored.filename, "etc_cron.d_x");
    }

    #[tokio::test]
    async fn test_cancel_only_from_active_states() {
        let (dispatcher, store, _queue) = dispatcher();
        let submission = dispatcher
            .submit("proj-1", "user-1", vec![upload("a.c")], ScanOptions::new())
            .await
            .unwrap();
        let scan_id = submission.scan.id;

        let cancelled = dispatcher.cancel(scan_id).await.unwrap();
        assert_eq!(cancelled.status, ScanStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let err = dispatcher.cancel(scan_id).await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(
            store.get_scan(scan_id).await.unwrap().status,
            ScanStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_scan() {
        let (dispatcher, _store, _queue) = dispatcher();
        let err = dispatcher.cancel(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
