//! Chunk ingestion.
//!
//! A chunk is staged on disk first and recorded in the session store
//! second. Recording is one atomic store operation that adds the index to
//! the received set and bumps `receivedChunks` only for a new index, so
//! retries and concurrent duplicates never double count.
//!
//! The bytes staged per session are tracked in `stagedBytes` and capped at
//! `upload.max_file_size`; a resubmitted index only counts its size change.

use serde::Serialize;

use chunkyard_core::models::{FIELD_FAILED_CHUNKS, FIELD_STAGED_BYTES};
use chunkyard_core::ChunkRecord;

use crate::error::{UploadError, UploadResult};
use crate::events::UploadEvent;
use crate::service::UploadService;

/// Outcome of one accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub chunk_index: u32,
    pub received_chunks: u64,
    pub total_chunks: u32,
    /// The index had been received before; its staged bytes were replaced.
    pub duplicate: bool,
}

/// Stage chunk `index` of `session_id` and record its receipt.
///
/// # Errors
///
/// - [`UploadError::SessionNotFound`] for unknown, expired or malformed sessions.
/// - [`UploadError::SessionClosed`] once the session left `uploading`.
/// - [`UploadError::IndexOutOfRange`] when `index >= totalChunks`.
/// - [`UploadError::InvalidInput`] when the payload exceeds `upload.max_chunk_size`,
///   or would push the bytes staged for the session past `upload.max_file_size`.
/// - [`UploadError::WriteFailure`] when staging fails; `failedChunks` is
///   incremented and the index is not recorded.
pub async fn write_chunk(
    service: &UploadService,
    session_id: &str,
    index: u32,
    data: &[u8],
) -> UploadResult<ChunkReceipt> {
    let session = service.load_session(session_id).await?;

    if !session.is_open() {
        return Err(UploadError::SessionClosed {
            id: session.id,
            status: session.status.to_string(),
        });
    }
    if !session.accepts_index(index) {
        return Err(UploadError::IndexOutOfRange {
            index,
            total: session.total_chunks,
        });
    }
    let max = service.limits().max_chunk_size;
    if data.len() > max {
        return Err(UploadError::InvalidInput(format!(
            "chunk of {} bytes exceeds the limit of {} bytes",
            data.len(),
            max
        )));
    }

    let previous = service.staging().chunk_len(session_id, index).await;
    let delta = data.len() as i64 - previous as i64;
    let staged = service
        .store()
        .incr_field(session_id, FIELD_STAGED_BYTES, delta)
        .await?
        .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;
    let limit = service.limits().max_file_size;
    if staged > 0 && staged as u64 > limit {
        release_staged(service, session_id, delta).await;
        return Err(UploadError::InvalidInput(format!(
            "chunk {} would stage {} bytes for the session, over the limit of {} bytes",
            index, staged, limit
        )));
    }

    if let Err(source) = service.staging().write_chunk(session_id, index, data).await {
        tracing::warn!(session = session_id, index, error = %source, "chunk write failed");
        release_staged(service, session_id, delta).await;
        if let Err(e) = service
            .store()
            .incr_field(session_id, FIELD_FAILED_CHUNKS, 1)
            .await
        {
            tracing::warn!(session = session_id, error = %e, "could not count failed chunk");
        }
        service.emit(UploadEvent::ChunkFailed {
            session_id: session_id.to_string(),
            index,
            reason: source.to_string(),
        });
        return Err(UploadError::WriteFailure { index, source });
    }

    let (received, duplicate) = match service.store().record_chunk(session_id, index).await? {
        ChunkRecord::Added { received } => (received, false),
        ChunkRecord::Duplicate { received } => (received, true),
        // Expired between the lookup and the record.
        ChunkRecord::Missing => return Err(UploadError::SessionNotFound(session_id.to_string())),
    };

    tracing::debug!(
        session = session_id,
        index,
        bytes = data.len(),
        received,
        duplicate,
        "chunk stored"
    );
    service.emit(UploadEvent::ChunkStored {
        session_id: session_id.to_string(),
        index,
        bytes: data.len() as u64,
        received: received as u32,
        total: session.total_chunks,
        duplicate,
    });

    Ok(ChunkReceipt {
        chunk_index: index,
        received_chunks: received,
        total_chunks: session.total_chunks,
        duplicate,
    })
}

/// Undo a `stagedBytes` reservation for a chunk that was not staged.
async fn release_staged(service: &UploadService, session_id: &str, delta: i64) {
    if let Err(e) = service
        .store()
        .incr_field(session_id, FIELD_STAGED_BYTES, -delta)
        .await
    {
        tracing::warn!(session = session_id, error = %e, "could not release staged bytes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::service::testing::{service, service_with};
    use crate::session::init_session;
    use chunkyard_core::NewSession;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn open(svc: &UploadService, total_chunks: u32) -> String {
        init_session(
            svc,
            NewSession {
                total_chunks,
                file_size: 6,
                file_name: "f.txt".to_string(),
                content_type: "text/plain".to_string(),
            },
        )
        .await
        .unwrap()
        .upload_id
    }

    #[tokio::test]
    async fn test_chunk_staged_and_counted() {
        let tmp = TempDir::new().unwrap();
        let (svc, events) = service(&tmp);
        let id = open(&svc, 3).await;

        let receipt = write_chunk(&svc, &id, 1, b"CD").await.unwrap();
        assert_eq!(receipt.received_chunks, 1);
        assert!(!receipt.duplicate);
        assert_eq!(
            std::fs::read(svc.staging().chunk_path(&id, 1)).unwrap(),
            b"CD"
        );
        assert_eq!(events.names(), vec!["session_created", "chunk_stored"]);
    }

    #[tokio::test]
    async fn test_resubmission_overwrites_without_double_count() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = open(&svc, 3).await;

        write_chunk(&svc, &id, 0, b"old").await.unwrap();
        let receipt = write_chunk(&svc, &id, 0, b"AB").await.unwrap();
        assert!(receipt.duplicate);
        assert_eq!(receipt.received_chunks, 1);
        assert_eq!(
            std::fs::read(svc.staging().chunk_path(&id, 0)).unwrap(),
            b"AB"
        );

        let session = svc.load_session(&id).await.unwrap();
        assert_eq!(session.received_chunks, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_records_nothing() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = open(&svc, 3).await;

        let err = write_chunk(&svc, &id, 3, b"x").await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::IndexOutOfRange { index: 3, total: 3 }
        ));
        assert!(!svc.staging().chunk_path(&id, 3).exists());
        assert!(svc.store().received(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let err = write_chunk(&svc, &uuid::Uuid::new_v4().to_string(), 0, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_oversized_chunk_rejected() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service_with(
            &tmp,
            UploadConfig {
                max_chunk_size: 2,
                ..UploadConfig::default()
            },
        );
        let id = open(&svc, 3).await;
        let err = write_chunk(&svc, &id, 0, b"ABC").await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_staged_bytes_capped_by_max_file_size() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service_with(
            &tmp,
            UploadConfig {
                max_file_size: 6,
                ..UploadConfig::default()
            },
        );
        let id = open(&svc, 3).await;

        write_chunk(&svc, &id, 0, b"AB").await.unwrap();
        write_chunk(&svc, &id, 1, b"CDEF").await.unwrap();
        let err = write_chunk(&svc, &id, 2, b"GH").await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput(_)));
        assert!(!svc.staging().chunk_path(&id, 2).exists());
        assert_eq!(svc.store().received(&id).await.unwrap(), vec![0, 1]);

        // Shrinking a resubmitted chunk frees room for the rest.
        write_chunk(&svc, &id, 1, b"CD").await.unwrap();
        write_chunk(&svc, &id, 2, b"EF").await.unwrap();
        let record = svc.store().get_record(&id).await.unwrap().unwrap();
        assert_eq!(record[FIELD_STAGED_BYTES], "6");
    }

    #[tokio::test]
    async fn test_write_failure_counts_and_skips_record() {
        let tmp = TempDir::new().unwrap();
        let (svc, events) = service(&tmp);
        let id = open(&svc, 3).await;

        // A plain file where the session directory should be.
        std::fs::create_dir_all(svc.staging().root()).unwrap();
        std::fs::write(svc.staging().session_dir(&id), b"blocker").unwrap();

        let err = write_chunk(&svc, &id, 0, b"AB").await.unwrap_err();
        assert!(matches!(err, UploadError::WriteFailure { index: 0, .. }));

        let session = svc.load_session(&id).await.unwrap();
        assert_eq!(session.failed_chunks, 1);
        assert_eq!(session.received_chunks, 0);
        assert!(svc.store().received(&id).await.unwrap().is_empty());
        assert!(events.names().contains(&"chunk_failed"));
        let record = svc.store().get_record(&id).await.unwrap().unwrap();
        assert_eq!(record[FIELD_STAGED_BYTES], "0");
    }

    #[tokio::test]
    async fn test_concurrent_distinct_indices() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let svc = Arc::new(svc);
        let id = open(&svc, 16).await;

        let mut handles = Vec::new();
        for i in 0..16u32 {
            let svc = svc.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                write_chunk(&svc, &id, i, &[i as u8]).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let session = svc.load_session(&id).await.unwrap();
        assert_eq!(session.received_chunks, 16);
        assert_eq!(svc.store().received(&id).await.unwrap().len(), 16);
    }
}
