//! Filesystem staging for chunks and assembled artifacts.
//!
//! Layout:
//!
//! ```text
//! <staging.root>/<session id>/chunk_<index>          staged chunk
//! <staging.artifact_root>/<session id>/<file name>   assembled artifact
//! ```
//!
//! Chunk writes land in a uniquely named temp file inside the session
//! directory and are renamed into place, so a reader sees either the old
//! bytes, the new bytes, or nothing.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Staging directories on local disk.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    artifact_root: PathBuf,
}

/// A session directory found under the staging root.
#[derive(Debug, Clone)]
pub struct StagedSession {
    pub id: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub bytes: u64,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>, artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            artifact_root: artifact_root.into(),
        }
    }

    /// Create both roots if missing.
    pub async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        fs::create_dir_all(&self.artifact_root).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn chunk_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.session_dir(session_id).join(format!("chunk_{}", index))
    }

    pub fn artifact_path(&self, session_id: &str, file_name: &str) -> PathBuf {
        self.artifact_root.join(session_id).join(file_name)
    }

    /// Where the assembler writes before the final rename.
    pub fn partial_path(&self, session_id: &str, file_name: &str) -> PathBuf {
        self.artifact_root
            .join(session_id)
            .join(format!("{}.partial", file_name))
    }

    /// Stage `data` as chunk `index`, replacing any previous copy.
    pub async fn write_chunk(&self, session_id: &str, index: u32, data: &[u8]) -> io::Result<()> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".chunk_{}.{}.tmp", index, Uuid::new_v4().simple()));
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp, self.chunk_path(session_id, index)).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    /// Size of the staged copy of chunk `index`, or 0 if there is none.
    pub async fn chunk_len(&self, session_id: &str, index: u32) -> u64 {
        fs::metadata(self.chunk_path(session_id, index))
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub async fn open_chunk(&self, session_id: &str, index: u32) -> io::Result<fs::File> {
        fs::File::open(self.chunk_path(session_id, index)).await
    }

    /// Remove a file, treating "already gone" as success. Returns whether
    /// a file was actually removed.
    pub async fn remove_file(path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove a directory if it exists and is empty.
    pub async fn remove_dir_if_empty(path: &Path) -> io::Result<()> {
        match fs::remove_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            // Non-empty directories fail with a platform-specific kind.
            Err(e) if path_has_entries(path).await => {
                tracing::debug!(path = %path.display(), error = %e, "directory not empty, kept");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Every session directory under the staging root.
    pub async fn staged_sessions(&self) -> io::Result<Vec<StagedSession>> {
        let mut sessions = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let id = match entry.file_name().to_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            let path = entry.path();
            sessions.push(StagedSession {
                bytes: dir_size(&path).await?,
                modified: metadata.modified()?,
                id,
                path,
            });
        }

        Ok(sessions)
    }

    /// Recursively remove a staged session directory.
    pub async fn remove_session_dir(&self, session_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn path_has_entries(path: &Path) -> bool {
    match fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

async fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut entries = fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// Reduce a client-declared file name to a safe single path component.
///
/// Directory parts (either separator) are dropped. Returns `None` when
/// nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return None;
    }
    Some(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn area(tmp: &TempDir) -> StagingArea {
        StagingArea::new(tmp.path().join("staging"), tmp.path().join("artifacts"))
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("f.txt").as_deref(), Some("f.txt"));
        assert_eq!(
            sanitize_file_name("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_file_name("C:\\docs\\report.pdf").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(sanitize_file_name(""), None);
        assert_eq!(sanitize_file_name("dir/.."), None);
        assert_eq!(sanitize_file_name("trailing/"), None);
    }

    #[tokio::test]
    async fn test_write_chunk_overwrites() {
        let tmp = TempDir::new().unwrap();
        let staging = area(&tmp);
        staging.write_chunk("s1", 0, b"first").await.unwrap();
        staging.write_chunk("s1", 0, b"second").await.unwrap();

        let bytes = std::fs::read(staging.chunk_path("s1", 0)).unwrap();
        assert_eq!(bytes, b"second");

        // No temp files left behind
        let names: Vec<_> = std::fs::read_dir(staging.session_dir("s1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["chunk_0".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_file_missing_is_ok() {
        let tmp = TempDir::new().unwrap();
        let removed = StagingArea::remove_file(&tmp.path().join("nothing"))
            .await
            .unwrap();
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_staged_sessions_lists_dirs() {
        let tmp = TempDir::new().unwrap();
        let staging = area(&tmp);
        staging.prepare().await.unwrap();
        staging.write_chunk("a", 0, b"xx").await.unwrap();
        staging.write_chunk("a", 1, b"yyy").await.unwrap();
        staging.write_chunk("b", 0, b"z").await.unwrap();
        std::fs::write(staging.root().join("stray.txt"), b"ignored").unwrap();

        let mut sessions = staging.staged_sessions().await.unwrap();
        sessions.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "a");
        assert_eq!(sessions[0].bytes, 5);
        assert_eq!(sessions[1].bytes, 1);
    }

    #[tokio::test]
    async fn test_remove_dir_if_empty_keeps_full_dir() {
        let tmp = TempDir::new().unwrap();
        let staging = area(&tmp);
        staging.write_chunk("s1", 0, b"x").await.unwrap();
        StagingArea::remove_dir_if_empty(&staging.session_dir("s1"))
            .await
            .unwrap();
        assert!(staging.session_dir("s1").exists());
    }
}
