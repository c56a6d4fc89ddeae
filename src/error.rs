//! Error taxonomy of the upload pipeline.
//!
//! Every upload operation returns [`UploadError`]. The HTTP layer maps each
//! variant to a status code and a machine-readable `code` via
//! [`UploadError::code`]; everything else in the crate (config, CLI,
//! bootstrap) stays on `anyhow`.

use thiserror::Error;

pub type UploadResult<T> = std::result::Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Malformed or out-of-policy request.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown, expired, or malformed session.
    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    #[error("chunk index {index} out of range (total chunks: {total})")]
    IndexOutOfRange { index: u32, total: u32 },

    /// Staging storage rejected a chunk. The client may retry the index.
    #[error("failed to stage chunk {index}: {source}")]
    WriteFailure {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("upload incomplete: {received} of {total} chunks received")]
    IncompleteUpload { received: u32, total: u32 },

    /// The session no longer accepts chunks.
    #[error("upload session {id} is {status}")]
    SessionClosed { id: String, status: String },

    #[error("assembled size {actual} does not match declared size {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("assembly failed: {0}")]
    AssemblyFailure(#[source] std::io::Error),

    /// The session store is unreachable or returned an error.
    #[error("session store failure: {0:#}")]
    StoreFailure(#[from] anyhow::Error),
}

impl UploadError {
    /// Machine-readable error code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidInput(_) => "bad_request",
            UploadError::SessionNotFound(_) => "not_found",
            UploadError::IndexOutOfRange { .. } => "index_out_of_range",
            UploadError::WriteFailure { .. } => "write_failure",
            UploadError::IncompleteUpload { .. } => "incomplete_upload",
            UploadError::SessionClosed { .. } => "session_closed",
            UploadError::SizeMismatch { .. } => "size_mismatch",
            UploadError::AssemblyFailure(_) => "assembly_failure",
            UploadError::StoreFailure(_) => "store_failure",
        }
    }

    /// Whether the client can usefully retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::WriteFailure { .. }
                | UploadError::IncompleteUpload { .. }
                | UploadError::StoreFailure(_)
                | UploadError::AssemblyFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            UploadError::SessionNotFound("x".into()).code(),
            "not_found"
        );
        assert_eq!(
            UploadError::IncompleteUpload {
                received: 2,
                total: 3
            }
            .code(),
            "incomplete_upload"
        );
    }

    #[test]
    fn test_store_failure_from_anyhow() {
        let err: UploadError = anyhow::anyhow!("connection refused").into();
        assert!(matches!(err, UploadError::StoreFailure(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_message_mentions_bounds() {
        let err = UploadError::IndexOutOfRange { index: 5, total: 3 };
        assert_eq!(
            err.to_string(),
            "chunk index 5 out of range (total chunks: 3)"
        );
        assert!(!err.is_retryable());
    }
}
