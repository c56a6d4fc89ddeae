//! # chunkyard core
//!
//! Shared, I/O-free logic for chunkyard: the upload session model, the
//! strict decoder that turns stored string records into typed sessions,
//! key naming, progress math, and the [`store::SessionStore`] abstraction
//! with an in-memory implementation.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O.

pub mod models;
pub mod progress;
pub mod store;

pub use models::{NewSession, RecordError, UploadSession, UploadStatus};
pub use store::{ChunkRecord, SessionStore};
