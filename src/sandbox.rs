//! Read-only browsing of task sandboxes.
//!
//! The resource manager reports a sandbox URL once a task runs. Only
//! `file://` sandboxes are readable here; every path is resolved relative to
//! the sandbox and may not leave it, symlinks included.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Result, SchedulerError};

/// Largest chunk returned by one read.
pub const MAX_CHUNK: u64 = 1024 * 1024;

/// Part of a sandbox file. `size` is the whole file's length, so callers can
/// page through it by advancing `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChunk {
    pub path: String,
    pub offset: u64,
    pub size: u64,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// Relative to the sandbox root.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub mtime: Option<DateTime<Utc>>,
}

/// Read up to `length` bytes of `path` starting at `offset`. A negative
/// length reads to the end of the file. Reads are capped at [`MAX_CHUNK`].
pub async fn read_chunk(url: &str, path: &str, offset: u64, length: i64) -> Result<FileChunk> {
    let file_path = resolve(url, path).await?;
    let mut file = tokio::fs::File::open(&file_path)
        .await
        .map_err(|e| io_error(path, e))?;
    let meta = file.metadata().await.map_err(|e| io_error(path, e))?;
    if meta.is_dir() {
        return Err(SchedulerError::Validation(format!("{} is a directory", path)));
    }

    let size = meta.len();
    let wanted = u64::try_from(length).unwrap_or(MAX_CHUNK).min(MAX_CHUNK);
    let mut buf = Vec::new();
    if offset < size {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error(path, e))?;
        file.take(wanted)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| io_error(path, e))?;
    }

    Ok(FileChunk {
        path: path.to_string(),
        offset,
        size,
        data: String::from_utf8_lossy(&buf).into_owned(),
    })
}

/// List a sandbox directory, sorted by name. An empty path or `.` is the
/// sandbox root.
pub async fn list_dir(url: &str, path: &str) -> Result<Vec<DirEntry>> {
    let root = sandbox_root(url).await?;
    let dir = resolve(url, path).await?;
    let mut reader = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| io_error(path, e))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(|e| io_error(path, e))? {
        let meta = entry.metadata().await.map_err(|e| io_error(path, e))?;
        let full = entry.path();
        let relative = full.strip_prefix(&root).unwrap_or(&full);
        entries.push(DirEntry {
            path: relative.to_string_lossy().into_owned(),
            size: meta.len(),
            is_dir: meta.is_dir(),
            mtime: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

async fn sandbox_root(url: &str) -> Result<PathBuf> {
    let Some(root) = url.strip_prefix("file://") else {
        return Err(SchedulerError::Validation(format!(
            "sandbox {} cannot be browsed from here",
            url
        )));
    };
    tokio::fs::canonicalize(root)
        .await
        .map_err(|e| io_error("sandbox", e))
}

/// Join `path` onto the sandbox and make sure the result stays inside it.
async fn resolve(url: &str, path: &str) -> Result<PathBuf> {
    let root = sandbox_root(url).await?;
    let relative = Path::new(path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(outside(path));
    }

    let resolved = tokio::fs::canonicalize(root.join(relative))
        .await
        .map_err(|e| io_error(path, e))?;
    if !resolved.starts_with(&root) {
        return Err(outside(path));
    }
    Ok(resolved)
}

fn outside(path: &str) -> SchedulerError {
    SchedulerError::Validation(format!("path {} leaves the sandbox", path))
}

fn io_error(path: &str, err: std::io::Error) -> SchedulerError {
    match err.kind() {
        std::io::ErrorKind::NotFound => SchedulerError::NotFound(format!("sandbox path {}", path)),
        _ => SchedulerError::Internal(format!("sandbox path {}: {}", path, err)),
    }
}
