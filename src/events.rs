//! Upload lifecycle event reporting.
//!
//! Every state change of an upload (session created, chunk stored or
//! failed, file assembled, staging cleaned, orphans reaped) is handed to an
//! [`UploadEventReporter`]. The reporter is constructed once and injected
//! into [`crate::service::UploadService`]; nothing reports through a global.
//! Events are emitted on **stderr** so stdout stays parseable for scripts.

use std::io::Write;
use std::sync::Mutex;

/// A single upload lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadEvent {
    SessionCreated {
        session_id: String,
        file_name: String,
        total_chunks: u32,
        file_size: u64,
    },
    ChunkStored {
        session_id: String,
        index: u32,
        bytes: u64,
        received: u32,
        total: u32,
        duplicate: bool,
    },
    ChunkFailed {
        session_id: String,
        index: u32,
        reason: String,
    },
    Assembled {
        session_id: String,
        file_name: String,
        bytes: u64,
    },
    CleanedUp {
        session_id: String,
        removed_files: u64,
    },
    Reaped {
        purged_records: u64,
        removed_dirs: u64,
        freed_bytes: u64,
    },
}

impl UploadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UploadEvent::SessionCreated { .. } => "session_created",
            UploadEvent::ChunkStored { .. } => "chunk_stored",
            UploadEvent::ChunkFailed { .. } => "chunk_failed",
            UploadEvent::Assembled { .. } => "assembled",
            UploadEvent::CleanedUp { .. } => "cleaned_up",
            UploadEvent::Reaped { .. } => "reaped",
        }
    }
}

/// Receives upload events. Implementations must not block for long; they
/// run inline on request handlers.
pub trait UploadEventReporter: Send + Sync {
    fn report(&self, event: UploadEvent);
}

/// Human-friendly lines on stderr: "upload 3f2a…  chunk 2 stored  2 / 3".
pub struct StderrEvents;

impl UploadEventReporter for StderrEvents {
    fn report(&self, event: UploadEvent) {
        let line = match &event {
            UploadEvent::SessionCreated {
                session_id,
                file_name,
                total_chunks,
                file_size,
            } => format!(
                "upload {}  created  {} ({} bytes, {} chunks)\n",
                session_id,
                file_name,
                format_number(*file_size),
                format_number(*total_chunks as u64)
            ),
            UploadEvent::ChunkStored {
                session_id,
                index,
                received,
                total,
                duplicate,
                ..
            } => format!(
                "upload {}  chunk {} {}  {} / {}\n",
                session_id,
                index,
                if *duplicate { "replaced" } else { "stored" },
                format_number(*received as u64),
                format_number(*total as u64)
            ),
            UploadEvent::ChunkFailed {
                session_id,
                index,
                reason,
            } => format!("upload {}  chunk {} failed: {}\n", session_id, index, reason),
            UploadEvent::Assembled {
                session_id,
                file_name,
                bytes,
            } => format!(
                "upload {}  assembled  {} ({} bytes)\n",
                session_id,
                file_name,
                format_number(*bytes)
            ),
            UploadEvent::CleanedUp {
                session_id,
                removed_files,
            } => format!(
                "upload {}  cleaned up  {} files\n",
                session_id, removed_files
            ),
            UploadEvent::Reaped {
                purged_records,
                removed_dirs,
                freed_bytes,
            } => format!(
                "reaper  {} expired records, {} orphaned dirs, {} bytes freed\n",
                format_number(*purged_records),
                format_number(*removed_dirs),
                format_number(*freed_bytes)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable events: one JSON object per line on stderr.
pub struct JsonEvents;

impl UploadEventReporter for JsonEvents {
    fn report(&self, event: UploadEvent) {
        let mut obj = match &event {
            UploadEvent::SessionCreated {
                session_id,
                file_name,
                total_chunks,
                file_size,
            } => serde_json::json!({
                "uploadId": session_id,
                "fileName": file_name,
                "totalChunks": total_chunks,
                "fileSize": file_size
            }),
            UploadEvent::ChunkStored {
                session_id,
                index,
                bytes,
                received,
                total,
                duplicate,
            } => serde_json::json!({
                "uploadId": session_id,
                "chunkIndex": index,
                "bytes": bytes,
                "receivedChunks": received,
                "totalChunks": total,
                "duplicate": duplicate
            }),
            UploadEvent::ChunkFailed {
                session_id,
                index,
                reason,
            } => serde_json::json!({
                "uploadId": session_id,
                "chunkIndex": index,
                "reason": reason
            }),
            UploadEvent::Assembled {
                session_id,
                file_name,
                bytes,
            } => serde_json::json!({
                "uploadId": session_id,
                "fileName": file_name,
                "bytes": bytes
            }),
            UploadEvent::CleanedUp {
                session_id,
                removed_files,
            } => serde_json::json!({
                "uploadId": session_id,
                "removedFiles": removed_files
            }),
            UploadEvent::Reaped {
                purged_records,
                removed_dirs,
                freed_bytes,
            } => serde_json::json!({
                "purgedRecords": purged_records,
                "removedDirs": removed_dirs,
                "freedBytes": freed_bytes
            }),
        };
        obj["event"] = serde_json::Value::from(event.name());
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when events are disabled.
pub struct NoEvents;

impl UploadEventReporter for NoEvents {
    fn report(&self, _event: UploadEvent) {}
}

/// Keeps every event in memory; used by tests and embedders that forward
/// events elsewhere.
#[derive(Default)]
pub struct CapturingEvents {
    events: Mutex<Vec<UploadEvent>>,
}

impl CapturingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UploadEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(UploadEvent::name).collect()
    }
}

impl UploadEventReporter for CapturingEvents {
    fn report(&self, event: UploadEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Event output mode: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventMode {
    Off,
    Human,
    Json,
}

impl EventMode {
    /// Parse the `logging.events` config value. Human output falls back to
    /// off when stderr is not a TTY.
    pub fn from_config(value: &str) -> Self {
        match value {
            "json" => EventMode::Json,
            "off" => EventMode::Off,
            _ => Self::default_for_tty(),
        }
    }

    /// Default: human events when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            EventMode::Human
        } else {
            EventMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn UploadEventReporter> {
        match self {
            EventMode::Off => Box::new(NoEvents),
            EventMode::Human => Box::new(StderrEvents),
            EventMode::Json => Box::new(JsonEvents),
        }
    }
}
