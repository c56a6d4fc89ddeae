//! Orphan reaper.
//!
//! Session records expire in the store, but their staged chunks stay on
//! disk. A sweep purges expired records, then removes every staging
//! directory that has no live session record and has not been touched for
//! `reaper.grace_secs`. The server runs sweeps on an interval; `chunkyard
//! reap` runs one on demand.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{UploadError, UploadResult};
use crate::events::UploadEvent;
use crate::service::UploadService;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    pub purged_records: u64,
    pub removed_dirs: u64,
    pub freed_bytes: u64,
}

/// Run one sweep. Directories younger than `grace` are skipped so that a
/// chunk racing a session's creation is never reaped.
pub async fn sweep(service: &UploadService, grace: Duration) -> UploadResult<ReapReport> {
    let mut report = ReapReport {
        purged_records: service.store().purge_expired().await?,
        ..ReapReport::default()
    };

    let staged = service
        .staging()
        .staged_sessions()
        .await
        .map_err(|e| UploadError::StoreFailure(anyhow::Error::new(e).context("listing staging root")))?;
    let now = SystemTime::now();

    for dir in staged {
        let age = now.duration_since(dir.modified).unwrap_or_default();
        if age < grace {
            continue;
        }
        if service.store().get_record(&dir.id).await?.is_some() {
            continue;
        }
        match service.staging().remove_session_dir(&dir.id).await {
            Ok(()) => {
                tracing::debug!(session = %dir.id, bytes = dir.bytes, "orphaned staging removed");
                report.removed_dirs += 1;
                report.freed_bytes += dir.bytes;
            }
            Err(e) => {
                tracing::warn!(path = %dir.path.display(), error = %e, "could not remove orphaned staging")
            }
        }
    }

    if report != ReapReport::default() {
        tracing::info!(
            purged_records = report.purged_records,
            removed_dirs = report.removed_dirs,
            freed_bytes = report.freed_bytes,
            "reaper sweep"
        );
        service.emit(UploadEvent::Reaped {
            purged_records: report.purged_records,
            removed_dirs: report.removed_dirs,
            freed_bytes: report.freed_bytes,
        });
    }

    Ok(report)
}

/// Sweep every `interval` until `shutdown` flips to `true`.
pub fn spawn(
    service: Arc<UploadService>,
    interval: Duration,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sweep(&service, grace).await {
                        tracing::warn!(error = %e, "reaper sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::service;
    use crate::session::init_session;
    use crate::writer::write_chunk;
    use chunkyard_core::NewSession;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweep_removes_orphans_only() {
        let tmp = TempDir::new().unwrap();
        let (svc, events) = service(&tmp);

        let live = init_session(
            &svc,
            NewSession {
                total_chunks: 2,
                file_size: 4,
                file_name: "f.txt".to_string(),
                content_type: String::new(),
            },
        )
        .await
        .unwrap()
        .upload_id;
        write_chunk(&svc, &live, 0, b"AB").await.unwrap();

        let orphan = uuid::Uuid::new_v4().to_string();
        svc.staging().write_chunk(&orphan, 0, b"XYZ").await.unwrap();

        let report = sweep(&svc, Duration::ZERO).await.unwrap();
        assert_eq!(report.removed_dirs, 1);
        assert_eq!(report.freed_bytes, 3);
        assert!(!svc.staging().session_dir(&orphan).exists());
        assert!(svc.staging().chunk_path(&live, 0).exists());
        assert_eq!(events.names().last(), Some(&"reaped"));
    }

    #[tokio::test]
    async fn test_sweep_respects_grace() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let orphan = uuid::Uuid::new_v4().to_string();
        svc.staging().write_chunk(&orphan, 0, b"XYZ").await.unwrap();

        let report = sweep(&svc, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report, ReapReport::default());
        assert!(svc.staging().session_dir(&orphan).exists());
    }

    #[tokio::test]
    async fn test_expired_session_staging_reaped() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let id = uuid::Uuid::new_v4().to_string();
        svc.store()
            .put_record(&id, &[("status".to_string(), "uploading".to_string())], Duration::ZERO)
            .await
            .unwrap();
        svc.staging().write_chunk(&id, 0, b"AB").await.unwrap();

        let report = sweep(&svc, Duration::ZERO).await.unwrap();
        assert_eq!(report.removed_dirs, 1);
        assert!(!svc.staging().session_dir(&id).exists());
    }

    #[tokio::test]
    async fn test_spawned_reaper_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let (svc, _) = service(&tmp);
        let (tx, rx) = watch::channel(false);
        let handle = spawn(Arc::new(svc), Duration::from_secs(3600), Duration::ZERO, rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
