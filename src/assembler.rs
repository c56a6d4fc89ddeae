//! Reassembly of staged chunks into the final artifact, and staging cleanup.
//!
//! Assembly streams chunks `0..totalChunks` in index order into
//! `<fileName>.partial`, hashing as it goes, and renames the partial file
//! into place only after every chunk was copied. The session is marked
//! `completed` right after the rename; if that store write fails the
//! artifact is removed again. Staged chunks are deleted only once the
//! session is `completed`, so any earlier failure leaves them for a retry.
//!
//! Assemblies of one session are serialized, so a concurrent retry waits
//! and then reports the artifact the first call produced.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use chunkyard_core::models::FIELD_STATUS;
use chunkyard_core::progress::{is_complete, missing_indices};
use chunkyard_core::{UploadSession, UploadStatus};

use crate::error::{UploadError, UploadResult};
use crate::events::UploadEvent;
use crate::service::UploadService;
use crate::staging::StagingArea;

const COPY_BUFFER: usize = 64 * 1024;

/// Result of a successful assembly.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledArtifact {
    pub upload_id: String,
    pub path: PathBuf,
    /// Measured size of the artifact in bytes.
    pub size: u64,
    /// Hex SHA-256 of the artifact.
    pub sha256: String,
    /// Whether `size` equals the size the client declared.
    pub size_matches: bool,
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub upload_id: String,
    pub removed_files: u64,
}

/// Concatenate the staged chunks of `session_id` into its artifact.
///
/// Re-assembling a `completed` session reports the existing artifact.
/// Concurrent calls for the same session run one after the other.
///
/// # Errors
///
/// - [`UploadError::SessionNotFound`] for unknown, expired or malformed sessions.
/// - [`UploadError::SessionClosed`] when the session is `failed`.
/// - [`UploadError::IncompleteUpload`] unless every index was received; no
///   artifact is created.
/// - [`UploadError::SizeMismatch`] with `upload.strict_size` when the
///   measured size differs from the declared one; the session becomes `failed`.
/// - [`UploadError::AssemblyFailure`] on I/O errors; staging is kept.
pub async fn assemble(service: &UploadService, session_id: &str) -> UploadResult<AssembledArtifact> {
    let _guard = service.lock_assembly(session_id).await;
    let session = service.load_session(session_id).await?;
    let staging = service.staging();
    let artifact = staging.artifact_path(session_id, &session.file_name);

    match session.status {
        UploadStatus::Uploading => {}
        UploadStatus::Completed => return existing_artifact(&session, artifact).await,
        UploadStatus::Failed => {
            return Err(UploadError::SessionClosed {
                id: session.id,
                status: session.status.to_string(),
            })
        }
    }

    let received = service.store().received(session_id).await?;
    if !is_complete(session.total_chunks, &received) {
        tracing::debug!(
            session = session_id,
            missing = ?missing_indices(session.total_chunks, &received),
            "assembly requested before all chunks arrived"
        );
        return Err(UploadError::IncompleteUpload {
            received: received.len() as u32,
            total: session.total_chunks,
        });
    }

    let partial = staging.partial_path(session_id, &session.file_name);
    let (size, sha256) = match concatenate(staging, &session, &partial).await {
        Ok(written) => written,
        Err(e) => {
            discard(&partial).await;
            tracing::warn!(session = session_id, error = %e, "assembly failed");
            return Err(UploadError::AssemblyFailure(e));
        }
    };

    let size_matches = size == session.file_size;
    if !size_matches {
        tracing::warn!(
            session = session_id,
            declared = session.file_size,
            actual = size,
            "assembled size differs from declared size"
        );
        if service.limits().strict_size {
            discard(&partial).await;
            service
                .store()
                .set_field(session_id, FIELD_STATUS, UploadStatus::Failed.as_str())
                .await?;
            return Err(UploadError::SizeMismatch {
                declared: session.file_size,
                actual: size,
            });
        }
    }

    if let Err(e) = fs::rename(&partial, &artifact).await {
        discard(&partial).await;
        return Err(UploadError::AssemblyFailure(e));
    }

    let marked = service
        .store()
        .set_field(session_id, FIELD_STATUS, UploadStatus::Completed.as_str())
        .await;
    match marked {
        Ok(true) => {}
        Ok(false) => {
            discard(&artifact).await;
            return Err(UploadError::SessionNotFound(session_id.to_string()));
        }
        Err(e) => {
            tracing::warn!(session = session_id, error = %e, "could not mark session completed");
            discard(&artifact).await;
            return Err(e.into());
        }
    }

    remove_chunks(staging, session_id, session.total_chunks).await;
    if let Err(e) = StagingArea::remove_dir_if_empty(&staging.session_dir(session_id)).await {
        tracing::warn!(session = session_id, error = %e, "could not remove staging directory");
    }

    tracing::info!(
        session = session_id,
        path = %artifact.display(),
        size,
        "upload assembled"
    );
    service.emit(UploadEvent::Assembled {
        session_id: session_id.to_string(),
        file_name: session.file_name.clone(),
        bytes: size,
    });

    Ok(AssembledArtifact {
        upload_id: session.id,
        path: artifact,
        size,
        sha256,
        size_matches,
    })
}

/// Best-effort removal of the staged chunks and any partial artifact of
/// `session_id`. Individual deletion failures are logged, never returned.
///
/// With `cancel` the session record and its received set are deleted too.
pub async fn cleanup(
    service: &UploadService,
    session_id: &str,
    cancel: bool,
) -> UploadResult<CleanupReport> {
    let _guard = service.lock_assembly(session_id).await;
    let session = service.load_session(session_id).await?;
    let staging = service.staging();

    let mut removed_files = remove_chunks(staging, session_id, session.total_chunks).await;
    let partial = staging.partial_path(session_id, &session.file_name);
    match StagingArea::remove_file(&partial).await {
        Ok(true) => removed_files += 1,
        Ok(false) => {}
        Err(e) => tracing::warn!(path = %partial.display(), error = %e, "could not remove partial artifact"),
    }

    let dirs = [
        staging.session_dir(session_id),
        partial.parent().map(Path::to_path_buf).unwrap_or_default(),
    ];
    for dir in dirs.iter().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = StagingArea::remove_dir_if_empty(dir).await {
            tracing::warn!(path = %dir.display(), error = %e, "could not remove directory");
        }
    }

    if cancel {
        service.store().delete(session_id).await?;
    }

    tracing::info!(session = session_id, removed_files, cancel, "staging cleaned up");
    service.emit(UploadEvent::CleanedUp {
        session_id: session_id.to_string(),
        removed_files,
    });

    Ok(CleanupReport {
        upload_id: session.id,
        removed_files,
    })
}

async fn concatenate(
    staging: &StagingArea,
    session: &UploadSession,
    partial: &Path,
) -> io::Result<(u64, String)> {
    if let Some(parent) = partial.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut out = fs::File::create(partial).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;

    for index in 0..session.total_chunks {
        let mut chunk = staging.open_chunk(&session.id, index).await.map_err(|e| {
            io::Error::new(e.kind(), format!("chunk {} unreadable: {}", index, e))
        })?;
        loop {
            let n = chunk.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            size += n as u64;
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok((size, hex::encode(hasher.finalize())))
}

async fn existing_artifact(
    session: &UploadSession,
    artifact: PathBuf,
) -> UploadResult<AssembledArtifact> {
    let mut file = fs::File::open(&artifact)
        .await
        .map_err(UploadError::AssemblyFailure)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(UploadError::AssemblyFailure)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(AssembledArtifact {
        upload_id: session.id.clone(),
        path: artifact,
        size,
        sha256: hex::encode(hasher.finalize()),
        size_matches: size == session.file_size,
    })
}

async fn remove_chunks(staging: &StagingArea, session_id: &str, total_chunks: u32) -> u64 {
    let mut removed = 0;
    for index in 0..total_chunks {
        let path = staging.chunk_path(session_id, index);
        match StagingArea::remove_file(&path).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not remove staged chunk")
            }
        }
    }
    removed
}

async fn discard(path: &Path) {
    if let Err(e) = StagingArea::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "could not remove artifact");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::service::testing::{service, service_with};
    use crate::session::init_session;
    use crate::writer::write_chunk;
    use crate::events::CapturingEvents;
    use async_trait::async_trait;
    use chunkyard_core::store::memory::InMemorySessionStore;
    use chunkyard_core::store::Fields;
    use chunkyard_core::{ChunkRecord, NewSession, SessionStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// In-memory store whose next status write fails.
    #[derive(Default)]
    struct FailingStatusStore {
        inner: InMemorySessionStore,
        fail_status: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for FailingStatusStore {
        async fn put_record(
            &self,
            key: &str,
            fields: &[(String, String)],
            ttl: Duration,
        ) -> anyhow::Result<()> {
            self.inner.put_record(key, fields, ttl).await
        }

        async fn get_record(&self, key: &str) -> anyhow::Result<Option<Fields>> {
            self.inner.get_record(key).await
        }

        async fn set_field(&self, key: &str, field: &str, value: &str) -> anyhow::Result<bool> {
            if field == FIELD_STATUS && self.fail_status.swap(false, Ordering::SeqCst) {
                anyhow::bail!("store unreachable");
            }
            self.inner.set_field(key, field, value).await
        }

        async fn incr_field(&self, key: &str, field: &str, delta: i64) -> anyhow::Result<Option<i64>> {
            self.inner.incr_field(key, field, delta).await
        }

        async fn record_chunk(&self, key: &str, index: u32) -> anyhow::Result<ChunkRecord> {
            self.inner.record_chunk(key, index).await
        }

        async fn received(&self, key: &str) -> anyhow::Result<Vec<u32>> {
            self.inner.received(key).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.inner.delete(key).await
        }

        async fn purge_expired(&self) -> anyhow::Result<u64> {
            self.inner.purge_expired().await
        }
    }

    async fn open(svc: &UploadService, file_size: u64) -> String {
        init_session(
            svc,
            NewSession {
                total_chunks: 3,
                file_size,
                file_name: "f.txt".to_string(),
                content_type: "text/plain".to_string(),
            },
        )
        .await
        .unwrap()
        .upload_id
    }

    async fn upload_all(svc: &UploadService, id: &str) {
        for (index, data) in [(2u32, "EF"), (0, "AB"), (1, "CD")] {
            write_chunk(svc, id, index, data.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_assembles_in_index_order() {
        let tmp = TempDir::new().unwrap();
        let (svc, events) = service(&tmp);
        let id = open(&svc, 6).await;
        upload_all(&svc, &id).await;

        let artifact = assemble(&svc, &id).await.unwrap();
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"ABCDEF");
        assert_eq!(artifact.size, 6);
        assert!(artifact.size_matches);
        assert_eq!(
            artifact.sha256,
            hex::encode(Sha256::digest(b"ABCDEF"))
        );

        for index in 0..3 {
            assert!(!svc.staging().chunk_path(&id, index).exists());
        }
        assert!(!svc.staging().session_dir(&id).exists());
        assert!(!svc.staging().partial_path(&id, "f.txt").exists());

        let session = svc.load_session(&id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Completed);
        assert_eq!(events.names().last(), Some(&"assembled"));
    }

    #[tokio::test]
    async fn test_incomplete_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = open(&svc, 6).await;
        write_chunk(&svc, &id, 0, b"AB").await.unwrap();
        write_chunk(&svc, &id, 2, b"EF").await.unwrap();

        let err = assemble(&svc, &id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::IncompleteUpload {
                received: 2,
                total: 3
            }
        ));
        assert!(!svc.staging().artifact_path(&id, "f.txt").exists());
        assert!(svc.staging().chunk_path(&id, 0).exists());
    }

    #[tokio::test]
    async fn test_reassemble_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = open(&svc, 6).await;
        upload_all(&svc, &id).await;

        let first = assemble(&svc, &id).await.unwrap();
        let second = assemble(&svc, &id).await.unwrap();
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(second.size, 6);
    }

    #[tokio::test]
    async fn test_chunks_rejected_after_completion() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = open(&svc, 6).await;
        upload_all(&svc, &id).await;
        assemble(&svc, &id).await.unwrap();

        let err = write_chunk(&svc, &id, 0, b"ZZ").await.unwrap_err();
        assert!(matches!(err, UploadError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn test_size_mismatch_lenient() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = open(&svc, 10).await;
        upload_all(&svc, &id).await;

        let artifact = assemble(&svc, &id).await.unwrap();
        assert!(!artifact.size_matches);
        assert_eq!(artifact.size, 6);
    }

    #[tokio::test]
    async fn test_size_mismatch_strict_fails_session() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service_with(
            &tmp,
            UploadConfig {
                strict_size: true,
                ..UploadConfig::default()
            },
        );
        let id = open(&svc, 10).await;
        upload_all(&svc, &id).await;

        let err = assemble(&svc, &id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::SizeMismatch {
                declared: 10,
                actual: 6
            }
        ));
        assert!(!svc.staging().artifact_path(&id, "f.txt").exists());
        assert!(!svc.staging().partial_path(&id, "f.txt").exists());
        let session = svc.load_session(&id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_staged_chunk_keeps_staging() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = open(&svc, 6).await;
        upload_all(&svc, &id).await;
        std::fs::remove_file(svc.staging().chunk_path(&id, 1)).unwrap();

        let err = assemble(&svc, &id).await.unwrap_err();
        assert!(matches!(err, UploadError::AssemblyFailure(_)));
        assert!(!svc.staging().partial_path(&id, "f.txt").exists());
        assert!(svc.staging().chunk_path(&id, 0).exists());
        let session = svc.load_session(&id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Uploading);
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_artifact() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FailingStatusStore::default());
        let svc = UploadService::from_parts(
            store.clone(),
            StagingArea::new(tmp.path().join("staging"), tmp.path().join("artifacts")),
            Arc::new(CapturingEvents::new()),
            UploadConfig::default(),
        );
        let id = open(&svc, 6).await;
        upload_all(&svc, &id).await;

        store.fail_status.store(true, Ordering::SeqCst);
        let err = assemble(&svc, &id).await.unwrap_err();
        assert!(matches!(err, UploadError::StoreFailure(_)));
        assert!(!svc.staging().artifact_path(&id, "f.txt").exists());
        for index in 0..3 {
            assert!(svc.staging().chunk_path(&id, index).exists());
        }
        let session = svc.load_session(&id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Uploading);

        let artifact = assemble(&svc, &id).await.unwrap();
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"ABCDEF");
        let session = svc.load_session(&id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Completed);
        assert!(!svc.staging().chunk_path(&id, 0).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_assemble_both_succeed() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let svc = Arc::new(svc);
        let chunk = vec![7u8; 1024 * 1024];
        let id = init_session(
            &svc,
            NewSession {
                total_chunks: 4,
                file_size: 4 * chunk.len() as u64,
                file_name: "big.bin".to_string(),
                content_type: String::new(),
            },
        )
        .await
        .unwrap()
        .upload_id;
        for index in 0..4 {
            write_chunk(&svc, &id, index, &chunk).await.unwrap();
        }

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let svc = svc.clone();
                let id = id.clone();
                tokio::spawn(async move { assemble(&svc, &id).await })
            })
            .collect();
        let mut digests = Vec::new();
        for handle in handles {
            let artifact = handle.await.unwrap().unwrap();
            assert_eq!(artifact.size, 4 * 1024 * 1024);
            digests.push(artifact.sha256);
        }
        assert_eq!(digests[0], digests[1]);
        assert!(!svc.staging().partial_path(&id, "big.bin").exists());
        let session = svc.load_session(&id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_cleanup_ignores_missing_chunks() {
        let tmp = TempDir::new().unwrap();
        let (svc, events) = service(&tmp);
        let id = open(&svc, 6).await;
        write_chunk(&svc, &id, 1, b"CD").await.unwrap();

        let report = cleanup(&svc, &id, false).await.unwrap();
        assert_eq!(report.removed_files, 1);
        assert!(!svc.staging().session_dir(&id).exists());
        // Record survives a plain cleanup
        assert!(svc.load_session(&id).await.is_ok());
        assert_eq!(events.names().last(), Some(&"cleaned_up"));
    }

    #[tokio::test]
    async fn test_cancel_deletes_record() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = open(&svc, 6).await;
        write_chunk(&svc, &id, 0, b"AB").await.unwrap();

        cleanup(&svc, &id, true).await.unwrap();
        assert!(matches!(
            svc.load_session(&id).await,
            Err(UploadError::SessionNotFound(_))
        ));
        assert!(svc.store().received(&id).await.unwrap().is_empty());
    }
}
