//! Upload HTTP server.
//!
//! Exposes the upload pipeline as a JSON HTTP API. Chunk bodies are raw
//! bytes; everything else is JSON.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/upload/init` | Open a session |
//! | `POST` | `/upload/chunk?uploadId=..&chunkIndex=..` | Stage one chunk (path configurable) |
//! | `GET`  | `/upload/progress/{uploadId}` | Session progress |
//! | `POST` | `/upload/assemble/{uploadId}` | Concatenate the chunks into the artifact |
//! | `DELETE` | `/upload/{uploadId}` | Cancel the session and clean up staging |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The chunk identifiers may also be sent as `x-upload-id` and
//! `x-chunk-index` headers; query parameters win when both are present.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "upload session not found: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `index_out_of_range` (400),
//! `not_found` (404), `session_closed` (409), `incomplete_upload` (409),
//! `size_mismatch` (422), `write_failure` (500), `assembly_failure` (500),
//! `store_failure` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser clients can
//! upload directly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, JsonRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use chunkyard_core::NewSession;

use crate::assembler::{self, AssembledArtifact, CleanupReport};
use crate::config::Config;
use crate::error::UploadError;
use crate::progress::{self, ProgressReport};
use crate::reaper;
use crate::service::UploadService;
use crate::session::{self, SessionHandle};
use crate::writer::{self, ChunkReceipt};

/// Starts the upload server and runs until Ctrl-C.
///
/// Binds to `[server].bind`, starts the reaper when
/// `reaper.interval_secs > 0`, and on shutdown stops the reaper and closes
/// the store.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_until(config, shutdown_signal()).await
}

/// Like [`run_server`], but stops when `shutdown` completes.
pub async fn run_server_until(
    config: &Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let service = Arc::new(UploadService::open(config).await?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let reaper_task = if config.reaper.interval_secs > 0 {
        Some(reaper::spawn(
            service.clone(),
            Duration::from_secs(config.reaper.interval_secs),
            Duration::from_secs(config.reaper.grace_secs),
            stop_rx,
        ))
    } else {
        None
    };

    let app = router(service.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Upload server listening on http://{}", listener.local_addr()?);
    tracing::info!(bind = %config.server.bind, "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    let _ = stop_tx.send(true);
    if let Some(task) = reaper_task {
        let _ = task.await;
    }
    service.close().await;
    tracing::info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Build the router over an open service. The chunk route lives at
/// `upload.chunk_endpoint`.
pub fn router(service: Arc<UploadService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let chunk_endpoint = service.limits().chunk_endpoint.clone();
    let body_limit = service.limits().max_chunk_size;

    Router::new()
        .route("/upload/init", post(handle_init))
        .route(
            &chunk_endpoint,
            post(handle_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/upload/progress/{id}", get(handle_progress))
        .route("/upload/assemble/{id}", post(handle_assemble))
        .route("/upload/{id}", delete(handle_cancel))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn status_for(err: &UploadError) -> StatusCode {
    match err {
        UploadError::InvalidInput(_) | UploadError::IndexOutOfRange { .. } => {
            StatusCode::BAD_REQUEST
        }
        UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        UploadError::SessionClosed { .. } | UploadError::IncompleteUpload { .. } => {
            StatusCode::CONFLICT
        }
        UploadError::SizeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        UploadError::WriteFailure { .. }
        | UploadError::AssemblyFailure(_)
        | UploadError::StoreFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(error = %err, retryable = err.is_retryable(), "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /upload/init ============

async fn handle_init(
    State(service): State<Arc<UploadService>>,
    body: Result<Json<NewSession>, JsonRejection>,
) -> Result<Json<SessionHandle>, AppError> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    Ok(Json(session::init_session(&service, request).await?))
}

// ============ POST /upload/chunk ============

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkParams {
    upload_id: Option<String>,
    chunk_index: Option<String>,
}

/// Pick a chunk identifier from the query string, falling back to a header.
fn chunk_param(query: Option<String>, headers: &HeaderMap, header: &str) -> Option<String> {
    query.or_else(|| {
        headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })
}

async fn handle_chunk(
    State(service): State<Arc<UploadService>>,
    Query(params): Query<ChunkParams>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ChunkReceipt>, AppError> {
    let upload_id = chunk_param(params.upload_id, &headers, "x-upload-id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| bad_request("uploadId is required"))?;
    let raw_index = chunk_param(params.chunk_index, &headers, "x-chunk-index")
        .ok_or_else(|| bad_request("chunkIndex is required"))?;
    let index: u32 = raw_index
        .trim()
        .parse()
        .map_err(|_| bad_request(format!("chunkIndex must be a non-negative integer, got {:?}", raw_index)))?;
    let data = body.map_err(|e| bad_request(e.body_text()))?;

    Ok(Json(
        writer::write_chunk(&service, &upload_id, index, &data).await?,
    ))
}

// ============ GET /upload/progress/{id} ============

async fn handle_progress(
    State(service): State<Arc<UploadService>>,
    Path(id): Path<String>,
) -> Result<Json<ProgressReport>, AppError> {
    Ok(Json(progress::get_progress(&service, &id).await?))
}

// ============ POST /upload/assemble/{id} ============

async fn handle_assemble(
    State(service): State<Arc<UploadService>>,
    Path(id): Path<String>,
) -> Result<Json<AssembledArtifact>, AppError> {
    Ok(Json(assembler::assemble(&service, &id).await?))
}

// ============ DELETE /upload/{id} ============

async fn handle_cancel(
    State(service): State<Arc<UploadService>>,
    Path(id): Path<String>,
) -> Result<Json<CleanupReport>, AppError> {
    Ok(Json(assembler::cleanup(&service, &id, true).await?))
}
