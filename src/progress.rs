//! Read-only progress reports.

use chrono::{DateTime, Utc};
use serde::Serialize;

use chunkyard_core::progress::percentage;
use chunkyard_core::UploadStatus;

use crate::error::UploadResult;
use crate::service::UploadService;

/// Snapshot of a session as served by `GET /upload/progress/{id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub upload_id: String,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub failed_chunks: u32,
    pub status: UploadStatus,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    /// Sorted indices of the chunks received so far.
    pub received_chunk_indices: Vec<u32>,
    pub percentage: u8,
}

/// Report the progress of `session_id`. Never mutates the session.
pub async fn get_progress(service: &UploadService, session_id: &str) -> UploadResult<ProgressReport> {
    let session = service.load_session(session_id).await?;
    let received_chunk_indices = service.store().received(session_id).await?;

    Ok(ProgressReport {
        percentage: percentage(session.received_chunks as u64, session.total_chunks as u64),
        upload_id: session.id,
        total_chunks: session.total_chunks,
        received_chunks: session.received_chunks,
        failed_chunks: session.failed_chunks,
        status: session.status,
        file_name: session.file_name,
        file_size: session.file_size,
        content_type: session.content_type,
        created_at: session.created_at,
        received_chunk_indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use crate::service::testing::service;
    use crate::session::init_session;
    use crate::writer::write_chunk;
    use chunkyard_core::NewSession;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_progress_any_order_reaches_100() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = init_session(
            &svc,
            NewSession {
                total_chunks: 3,
                file_size: 6,
                file_name: "f.txt".to_string(),
                content_type: "text/plain".to_string(),
            },
        )
        .await
        .unwrap()
        .upload_id;

        write_chunk(&svc, &id, 2, b"EF").await.unwrap();
        let report = get_progress(&svc, &id).await.unwrap();
        assert_eq!(report.percentage, 33);
        assert_eq!(report.received_chunk_indices, vec![2]);

        write_chunk(&svc, &id, 0, b"AB").await.unwrap();
        write_chunk(&svc, &id, 1, b"CD").await.unwrap();
        let report = get_progress(&svc, &id).await.unwrap();
        assert_eq!(report.received_chunks, 3);
        assert_eq!(report.percentage, 100);
        assert_eq!(report.received_chunk_indices, vec![0, 1, 2]);
        assert_eq!(report.status, UploadStatus::Uploading);
    }

    #[tokio::test]
    async fn test_progress_unknown_session() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let err = get_progress(&svc, &uuid::Uuid::new_v4().to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[test]
    fn test_report_json_names() {
        let report = ProgressReport {
            upload_id: "u".to_string(),
            total_chunks: 2,
            received_chunks: 1,
            failed_chunks: 0,
            status: UploadStatus::Uploading,
            file_name: "f".to_string(),
            file_size: 2,
            content_type: "text/plain".to_string(),
            created_at: Utc::now(),
            received_chunk_indices: vec![1],
            percentage: 50,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["receivedChunks"], 1);
        assert_eq!(json["receivedChunkIndices"], serde_json::json!([1]));
        assert_eq!(json["status"], "uploading");
    }
}
