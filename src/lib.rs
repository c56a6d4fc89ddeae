//! # chunkyard
//!
//! Resumable chunked file uploads: a client opens a session, sends chunks
//! in any order (and retries any of them), polls progress, and asks for the
//! chunks to be reassembled in index order into the final artifact.
//!
//! ## Architecture
//!
//! ```text
//!  POST /upload/init ──▶ session ──┐
//!  POST /upload/chunk ─▶ writer ───┤       ┌──────────────┐
//!  GET  /upload/progress ▶ progress┼──────▶│ SessionStore │ (SQLite / memory)
//!  POST /upload/assemble ▶ assembler       └──────────────┘
//!                              │           ┌──────────────┐
//!                              └──────────▶│ StagingArea  │ (chunk files, artifacts)
//!                  reaper ────────────────▶└──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chunkyard init                # create database and staging directories
//! chunkyard serve               # start the HTTP server
//! chunkyard status <id>         # inspect a session
//! chunkyard reap                # reclaim abandoned uploads
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite-backed session store |
//! | [`staging`] | Chunk and artifact files on disk |
//! | [`service`] | Shared handle over store, staging and events |
//! | [`session`] | Session initialization |
//! | [`writer`] | Chunk ingestion |
//! | [`progress`] | Progress reports |
//! | [`assembler`] | Reassembly and cleanup |
//! | [`reaper`] | Expired session and orphaned staging sweeps |
//! | [`events`] | Upload lifecycle event reporting |
//! | [`error`] | Upload error taxonomy |
//! | [`logging`] | Diagnostic logging setup |
//! | [`server`] | HTTP server |

pub mod assembler;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod reaper;
pub mod server;
pub mod service;
pub mod session;
pub mod sqlite_store;
pub mod staging;
pub mod writer;

pub use chunkyard_core::{NewSession, UploadSession, UploadStatus};
pub use error::{UploadError, UploadResult};
