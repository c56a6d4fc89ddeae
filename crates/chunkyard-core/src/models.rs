//! Upload session model and its string-record encoding.
//!
//! Sessions are persisted as flat string maps (one field per attribute) so
//! that any key-value backend can hold them. [`UploadSession::from_fields`]
//! is the only way back to a typed session: a record missing a field, or
//! carrying a value that does not parse, is rejected as a whole.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FIELD_TOTAL_CHUNKS: &str = "totalChunks";
pub const FIELD_RECEIVED_CHUNKS: &str = "receivedChunks";
pub const FIELD_FAILED_CHUNKS: &str = "failedChunks";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_FILE_SIZE: &str = "fileSize";
pub const FIELD_FILE_NAME: &str = "fileName";
pub const FIELD_CONTENT_TYPE: &str = "contentType";
pub const FIELD_CREATED_AT: &str = "createdAt";
/// Bytes currently staged for the session. Maintained by the chunk writer
/// and absent from records that never staged a chunk.
pub const FIELD_STAGED_BYTES: &str = "stagedBytes";

/// Key of the companion set holding the received chunk indices of a session.
pub fn received_key(session_id: &str) -> String {
    format!("{}:chunks_received", session_id)
}

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(UploadStatus::Uploading),
            "completed" => Ok(UploadStatus::Completed),
            // Older records spell the failure state "error".
            "failed" | "error" => Ok(UploadStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Parameters declared by the client when opening a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub total_chunks: u32,
    pub file_size: u64,
    pub file_name: String,
    #[serde(default)]
    pub content_type: String,
}

/// Why a stored record could not be decoded into an [`UploadSession`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` has invalid value `{value}`")]
    Invalid { field: &'static str, value: String },
    #[error("totalChunks must be positive")]
    ZeroChunks,
}

/// One in-progress (or finished) chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub failed_chunks: u32,
    pub status: UploadStatus,
    pub file_size: u64,
    pub file_name: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    /// A fresh session with zeroed counters in the `uploading` state.
    pub fn new(id: String, request: NewSession, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            total_chunks: request.total_chunks,
            received_chunks: 0,
            failed_chunks: 0,
            status: UploadStatus::Uploading,
            file_size: request.file_size,
            file_name: request.file_name,
            content_type: request.content_type,
            created_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == UploadStatus::Uploading
    }

    pub fn accepts_index(&self, index: u32) -> bool {
        index < self.total_chunks
    }

    /// Encode every attribute except the id (which is the record key).
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_TOTAL_CHUNKS.to_string(), self.total_chunks.to_string()),
            (
                FIELD_RECEIVED_CHUNKS.to_string(),
                self.received_chunks.to_string(),
            ),
            (FIELD_FAILED_CHUNKS.to_string(), self.failed_chunks.to_string()),
            (FIELD_STATUS.to_string(), self.status.as_str().to_string()),
            (FIELD_FILE_SIZE.to_string(), self.file_size.to_string()),
            (FIELD_FILE_NAME.to_string(), self.file_name.clone()),
            (FIELD_CONTENT_TYPE.to_string(), self.content_type.clone()),
            (FIELD_CREATED_AT.to_string(), self.created_at.to_rfc3339()),
        ]
    }

    /// Strictly decode a stored record.
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Self, RecordError> {
        let total_chunks: u32 = parse_field(fields, FIELD_TOTAL_CHUNKS)?;
        if total_chunks == 0 {
            return Err(RecordError::ZeroChunks);
        }

        let status_raw = require(fields, FIELD_STATUS)?;
        let status = status_raw
            .parse::<UploadStatus>()
            .map_err(|_| RecordError::Invalid {
                field: FIELD_STATUS,
                value: status_raw.to_string(),
            })?;

        let created_raw = require(fields, FIELD_CREATED_AT)?;
        let created_at = DateTime::parse_from_rfc3339(created_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| RecordError::Invalid {
                field: FIELD_CREATED_AT,
                value: created_raw.to_string(),
            })?;

        Ok(Self {
            id: id.to_string(),
            total_chunks,
            received_chunks: parse_field(fields, FIELD_RECEIVED_CHUNKS)?,
            failed_chunks: parse_field(fields, FIELD_FAILED_CHUNKS)?,
            status,
            file_size: parse_field(fields, FIELD_FILE_SIZE)?,
            file_name: require(fields, FIELD_FILE_NAME)?.to_string(),
            content_type: require(fields, FIELD_CONTENT_TYPE)?.to_string(),
            created_at,
        })
    }
}

fn require<'a>(
    fields: &'a HashMap<String, String>,
    name: &'static str,
) -> Result<&'a str, RecordError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or(RecordError::Missing(name))
}

fn parse_field<T: FromStr>(
    fields: &HashMap<String, String>,
    name: &'static str,
) -> Result<T, RecordError> {
    let raw = require(fields, name)?;
    raw.trim().parse::<T>().map_err(|_| RecordError::Invalid {
        field: name,
        value: raw.to_string(),
    })
}
