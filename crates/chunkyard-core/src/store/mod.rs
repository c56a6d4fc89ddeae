//! Session state storage abstraction.
//!
//! The [`SessionStore`] trait is a small key-value surface shaped after
//! what the upload pipeline needs from a Redis-like backend: string-field
//! records with a TTL, a companion set of received chunk indices per
//! record, and one atomic "record this chunk" operation.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Decoded-later field map of one stored record.
pub type Fields = HashMap<String, String>;

/// Outcome of [`SessionStore::record_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRecord {
    /// The index was new; `received` is the counter after the increment.
    Added { received: u64 },
    /// The index was already a member; the counter was left alone.
    Duplicate { received: u64 },
    /// No live record exists under the key.
    Missing,
}

/// Abstract key-value backend for upload session state.
///
/// Expired records must read as absent. The received set of a record
/// lives under [`received_key`](crate::models::received_key) and shares the
/// record's expiry.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put_record`](SessionStore::put_record) | Create or replace a record with a TTL |
/// | [`get_record`](SessionStore::get_record) | Read all fields of a live record |
/// | [`set_field`](SessionStore::set_field) | Overwrite one field |
/// | [`incr_field`](SessionStore::incr_field) | Add to a numeric field |
/// | [`record_chunk`](SessionStore::record_chunk) | Atomic set-add + conditional counter increment |
/// | [`received`](SessionStore::received) | Sorted received indices |
/// | [`delete`](SessionStore::delete) | Drop a record and its set |
/// | [`purge_expired`](SessionStore::purge_expired) | Physically remove expired records |
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create or replace the record under `key`, expiring `ttl` from now.
    async fn put_record(&self, key: &str, fields: &[(String, String)], ttl: Duration)
        -> Result<()>;

    /// All fields of the record, or `None` if absent or expired.
    async fn get_record(&self, key: &str) -> Result<Option<Fields>>;

    /// Overwrite a single field. Returns `false` if the record is absent.
    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Add `delta` to a numeric field, returning the new value, or `None`
    /// if the record is absent.
    async fn incr_field(&self, key: &str, field: &str, delta: i64) -> Result<Option<i64>>;

    /// Add `index` to the record's received set and, only if it was not
    /// already a member, increment its `receivedChunks` field. Both steps
    /// happen atomically with respect to other calls on the same key.
    async fn record_chunk(&self, key: &str, index: u32) -> Result<ChunkRecord>;

    /// Received indices of the record, ascending. Empty if absent.
    async fn received(&self, key: &str) -> Result<Vec<u32>>;

    /// Remove the record and its received set. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every expired record, returning how many were dropped.
    async fn purge_expired(&self) -> Result<u64>;
}
