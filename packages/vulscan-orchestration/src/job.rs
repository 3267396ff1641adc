use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use vulscan_storage::{FileId, ScanId};

/// Unit of work handed from the dispatcher to a worker
///
/// Wire form: `{"scan_id": "<uuid>", "file_ids": ["<uuid>", ...]}`. The
/// file list is informational; the worker re-reads the scan's snapshot
/// from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJob {
    pub scan_id: ScanId,
    pub file_ids: Vec<FileId>,
}

impl ScanJob {
    pub fn new(scan_id: ScanId, file_ids: impl IntoIterator<Item = FileId>) -> Self {
        Self {
            scan_id,
            file_ids: file_ids.into_iter().collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| OrchestratorError::invalid_request(e))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| OrchestratorError::invalid_request(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_wire_form() {
        let scan_id = Uuid::new_v4();
        let file_id = Uuid::new_v4();
        let job = ScanJob::new(scan_id, [file_id]);

        let json = job.to_json().unwrap();
        assert!(json.contains(&scan_id.to_string()));
        assert!(json.contains("\"file_ids\""));

        assert_eq!(ScanJob::from_json(&json).unwrap(), job);
    }

    #[test]
    fn test_malformed_job_rejected() {
        let err = ScanJob::from_json(r#"{"scan_id":"not-a-uuid","file_ids":[]}"#).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }
}
