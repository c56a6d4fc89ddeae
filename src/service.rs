//! The upload service handle shared by the HTTP server and the CLI.
//!
//! [`UploadService`] bundles the session store, the staging area, the event
//! reporter and the upload limits. It is built once at startup with
//! [`UploadService::open`] and torn down with [`UploadService::close`];
//! every upload operation ([`crate::session`], [`crate::writer`],
//! [`crate::progress`], [`crate::assembler`], [`crate::reaper`]) borrows it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use chunkyard_core::store::memory::InMemorySessionStore;
use chunkyard_core::{SessionStore, UploadSession};

use crate::config::{Config, UploadConfig};
use crate::error::{UploadError, UploadResult};
use crate::events::{EventMode, UploadEvent, UploadEventReporter};
use crate::sqlite_store::SqliteSessionStore;
use crate::staging::StagingArea;

pub struct UploadService {
    store: Arc<dyn SessionStore>,
    staging: StagingArea,
    events: Arc<dyn UploadEventReporter>,
    limits: UploadConfig,
    sqlite: Option<Arc<SqliteSessionStore>>,
    /// Per-session locks serializing assembly and cleanup.
    assembly_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl UploadService {
    /// Connect to the configured database, make sure the schema and the
    /// staging directories exist, and build the event reporter from
    /// `logging.events`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = crate::db::connect(config).await?;
        crate::migrate::apply(&pool)
            .await
            .context("Failed to apply migrations")?;

        let staging = StagingArea::new(&config.staging.root, &config.staging.artifact_root);
        staging.prepare().await.with_context(|| {
            format!(
                "Failed to create staging directories under {}",
                config.staging.root.display()
            )
        })?;

        let sqlite = Arc::new(SqliteSessionStore::new(pool));
        let events: Arc<dyn UploadEventReporter> =
            Arc::from(EventMode::from_config(&config.logging.events).reporter());

        tracing::debug!(db = %config.db.path.display(), "upload service opened");

        Ok(Self {
            store: sqlite.clone(),
            staging,
            events,
            limits: config.upload.clone(),
            sqlite: Some(sqlite),
            assembly_locks: Mutex::default(),
        })
    }

    /// Assemble a service from explicit parts. Used by tests and embedders
    /// that bring their own store.
    pub fn from_parts(
        store: Arc<dyn SessionStore>,
        staging: StagingArea,
        events: Arc<dyn UploadEventReporter>,
        limits: UploadConfig,
    ) -> Self {
        Self {
            store,
            staging,
            events,
            limits,
            sqlite: None,
            assembly_locks: Mutex::default(),
        }
    }

    /// A service backed by [`InMemorySessionStore`].
    pub fn in_memory(
        staging: StagingArea,
        events: Arc<dyn UploadEventReporter>,
        limits: UploadConfig,
    ) -> Self {
        Self::from_parts(
            Arc::new(InMemorySessionStore::new()),
            staging,
            events,
            limits,
        )
    }

    /// Release the database pool, if any.
    pub async fn close(&self) {
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn limits(&self) -> &UploadConfig {
        &self.limits
    }

    /// Wait for exclusive assembly rights on `session_id`. Locks nobody
    /// holds or waits for are dropped from the map on the way in.
    pub(crate) async fn lock_assembly(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .assembly_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(session_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub(crate) fn emit(&self, event: UploadEvent) {
        self.events.report(event);
    }

    /// Fetch and strictly decode a session record.
    ///
    /// Ids that are not UUIDs, absent or expired records, and records that
    /// fail to decode all surface as [`UploadError::SessionNotFound`].
    pub async fn load_session(&self, session_id: &str) -> UploadResult<UploadSession> {
        if Uuid::parse_str(session_id).is_err() {
            return Err(UploadError::SessionNotFound(session_id.to_string()));
        }

        let fields = self
            .store
            .get_record(session_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        UploadSession::from_fields(session_id, &fields).map_err(|e| {
            tracing::warn!(session = session_id, error = %e, "malformed session record");
            UploadError::SessionNotFound(session_id.to_string())
        })
    }
}
