//! In-memory [`SessionStore`] implementation for testing and single-process
//! deployments.
//!
//! Uses a `HashMap` behind `std::sync::Mutex`. A record and its received
//! set are kept in one entry so [`SessionStore::record_chunk`] is a single
//! critical section. Expiry is checked on read.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::FIELD_RECEIVED_CHUNKS;

use super::{ChunkRecord, Fields, SessionStore};

struct Entry {
    fields: Fields,
    received: BTreeSet<u32>,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// In-memory session store.
pub struct InMemorySessionStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("session store lock poisoned"))
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Utc::now();
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

fn parse_counter(fields: &Fields, field: &str) -> Result<i64> {
    match fields.get(field) {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| anyhow!("field {} is not an integer: {}", field, raw)),
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put_record(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)?;
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry {
                fields: fields.iter().cloned().collect(),
                received: BTreeSet::new(),
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<Fields>> {
        let mut entries = self.lock()?;
        Ok(live(&mut entries, key).map(|e| e.fields.clone()))
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(entry) => {
                entry.fields.insert(field.to_string(), value.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_field(&self, key: &str, field: &str, delta: i64) -> Result<Option<i64>> {
        let mut entries = self.lock()?;
        let entry = match live(&mut entries, key) {
            Some(e) => e,
            None => return Ok(None),
        };
        let next = parse_counter(&entry.fields, field)? + delta;
        entry.fields.insert(field.to_string(), next.to_string());
        Ok(Some(next))
    }

    async fn record_chunk(&self, key: &str, index: u32) -> Result<ChunkRecord> {
        let mut entries = self.lock()?;
        let entry = match live(&mut entries, key) {
            Some(e) => e,
            None => return Ok(ChunkRecord::Missing),
        };
        let current = parse_counter(&entry.fields, FIELD_RECEIVED_CHUNKS)?;
        if !entry.received.insert(index) {
            return Ok(ChunkRecord::Duplicate {
                received: current as u64,
            });
        }
        let next = current + 1;
        entry
            .fields
            .insert(FIELD_RECEIVED_CHUNKS.to_string(), next.to_string());
        Ok(ChunkRecord::Added {
            received: next as u64,
        })
    }

    async fn received(&self, key: &str) -> Result<Vec<u32>> {
        let mut entries = self.lock()?;
        Ok(live(&mut entries, key)
            .map(|e| e.received.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.lock()?;
        entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok((before - entries.len()) as u64)
    }
}
