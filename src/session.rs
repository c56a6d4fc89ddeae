//! Session initialization.
//!
//! Validates the client's declaration, writes a fresh session record with
//! the configured TTL, and tells the client where to send chunks.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use chunkyard_core::{NewSession, UploadSession};

use crate::error::{UploadError, UploadResult};
use crate::events::UploadEvent;
use crate::service::UploadService;
use crate::staging::sanitize_file_name;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Returned to the client after a session is opened.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub upload_id: String,
    pub endpoint: String,
}

/// Open a new upload session.
///
/// # Errors
///
/// - [`UploadError::InvalidInput`] when `totalChunks` is zero or above
///   `upload.max_chunks`, `fileSize` is above `upload.max_file_size`, or the
///   file name has no usable final component.
/// - [`UploadError::StoreFailure`] when the record cannot be written.
pub async fn init_session(
    service: &UploadService,
    request: NewSession,
) -> UploadResult<SessionHandle> {
    let limits = service.limits();

    if request.total_chunks == 0 {
        return Err(UploadError::InvalidInput(
            "totalChunks must be a positive integer".to_string(),
        ));
    }
    if request.total_chunks > limits.max_chunks {
        return Err(UploadError::InvalidInput(format!(
            "totalChunks {} exceeds the limit of {}",
            request.total_chunks, limits.max_chunks
        )));
    }
    if request.file_size > limits.max_file_size {
        return Err(UploadError::InvalidInput(format!(
            "fileSize {} exceeds the limit of {}",
            request.file_size, limits.max_file_size
        )));
    }

    let file_name = sanitize_file_name(&request.file_name).ok_or_else(|| {
        UploadError::InvalidInput(format!("invalid fileName: {:?}", request.file_name))
    })?;
    let content_type = match request.content_type.trim() {
        "" => DEFAULT_CONTENT_TYPE.to_string(),
        ct => ct.to_string(),
    };

    let id = Uuid::new_v4().to_string();
    let session = UploadSession::new(
        id.clone(),
        NewSession {
            file_name,
            content_type,
            ..request
        },
        Utc::now(),
    );

    service
        .store()
        .put_record(&id, &session.to_fields(), limits.session_ttl())
        .await?;

    tracing::info!(
        session = %id,
        file = %session.file_name,
        total_chunks = session.total_chunks,
        file_size = session.file_size,
        "upload session created"
    );
    service.emit(UploadEvent::SessionCreated {
        session_id: id.clone(),
        file_name: session.file_name,
        total_chunks: session.total_chunks,
        file_size: session.file_size,
    });

    Ok(SessionHandle {
        upload_id: id,
        endpoint: limits.chunk_endpoint.clone(),
    })
}
