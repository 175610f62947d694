//! Shared files and download targets.
//!
//! A [`ShareStore`] answers browse, search and upload reads for the files a
//! member shares. A [`ChunkSink`] receives the chunks of one download, in
//! whatever order the router delivers them.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use veil_shared::protocol::FileInfo;
use veil_shared::VeilError;

use crate::error::ClientError;

/// Upper bound on hits returned for one keyword.
const MAX_SEARCH_RESULTS: usize = 256;

#[async_trait]
pub trait ShareStore: Send + Sync {
    /// Files directly inside `path` ("" is the share root).
    async fn list(&self, path: &str) -> Result<Vec<FileInfo>, ClientError>;

    /// Files anywhere in the share whose name contains `keyword`, ignoring case.
    async fn search(&self, keyword: &str) -> Result<Vec<FileInfo>, ClientError>;

    async fn lookup(&self, path: &str) -> Result<Option<FileInfo>, ClientError>;

    async fn read(&self, path: &str, offset: u64, size: u64) -> Result<Vec<u8>, ClientError>;
}

#[async_trait]
pub trait ChunkSink: Send {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), ClientError>;

    async fn finish(&mut self) -> Result<(), ClientError>;
}

fn matches(name: &str, keyword: &str) -> bool {
    name.to_lowercase().contains(&keyword.to_lowercase())
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files
            .get_mut()
            .insert(normalize(path).to_string(), data.into());
        self
    }

    pub async fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.files
            .write()
            .await
            .insert(normalize(path).to_string(), data.into());
    }
}

fn info(path: &str, data: &[u8]) -> FileInfo {
    FileInfo {
        path: path.to_string(),
        size: data.len() as u64,
    }
}

#[async_trait]
impl ShareStore for MemoryStore {
    async fn list(&self, path: &str) -> Result<Vec<FileInfo>, ClientError> {
        let dir = normalize(path);
        let files = self.files.read().await;
        Ok(files
            .iter()
            .filter(|(p, _)| parent(p) == dir)
            .map(|(p, data)| info(p, data))
            .collect())
    }

    async fn search(&self, keyword: &str) -> Result<Vec<FileInfo>, ClientError> {
        let files = self.files.read().await;
        Ok(files
            .iter()
            .filter(|(p, _)| matches(p.rsplit('/').next().unwrap_or(p), keyword))
            .take(MAX_SEARCH_RESULTS)
            .map(|(p, data)| info(p, data))
            .collect())
    }

    async fn lookup(&self, path: &str) -> Result<Option<FileInfo>, ClientError> {
        let path = normalize(path);
        Ok(self.files.read().await.get(path).map(|data| info(path, data)))
    }

    async fn read(&self, path: &str, offset: u64, size: u64) -> Result<Vec<u8>, ClientError> {
        let files = self.files.read().await;
        let data = files
            .get(normalize(path))
            .ok_or_else(|| VeilError::not_found(format!("no shared file {path}")))?;
        let start = usize::try_from(offset).ok();
        let end = offset
            .checked_add(size)
            .and_then(|end| usize::try_from(end).ok());
        match (start, end) {
            (Some(start), Some(end)) if end <= data.len() => Ok(data[start..end].to_vec()),
            _ => Err(VeilError::validation(format!("range {offset}+{size} outside {path}")).into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// Shares everything below `root`. Paths are `/`-separated and relative to
/// the root; anything that would escape it is refused.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ClientError> {
        let mut resolved = self.root.clone();
        for part in normalize(path).split('/').filter(|p| !p.is_empty()) {
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(name)), None) => resolved.push(name),
                _ => {
                    return Err(VeilError::validation(format!("path {path} leaves the share")).into())
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ShareStore for FsStore {
    async fn list(&self, path: &str) -> Result<Vec<FileInfo>, ClientError> {
        let dir = self.resolve(path)?;
        let prefix = normalize(path);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VeilError::not_found(format!("no shared folder {path}")).into())
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            files.push(FileInfo {
                path: join(prefix, &name),
                size: meta.len(),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn search(&self, keyword: &str) -> Result<Vec<FileInfo>, ClientError> {
        let mut hits = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = join(&prefix, &name);
                if meta.is_dir() {
                    pending.push((entry.path(), path));
                } else if meta.is_file() && matches(&name, keyword) {
                    hits.push(FileInfo {
                        path,
                        size: meta.len(),
                    });
                    if hits.len() >= MAX_SEARCH_RESULTS {
                        return Ok(hits);
                    }
                }
            }
        }
        Ok(hits)
    }

    async fn lookup(&self, path: &str) -> Result<Option<FileInfo>, ClientError> {
        let resolved = self.resolve(path)?;
        match fs::metadata(&resolved).await {
            Ok(meta) if meta.is_file() => Ok(Some(FileInfo {
                path: normalize(path).to_string(),
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str, offset: u64, size: u64) -> Result<Vec<u8>, ClientError> {
        let resolved = self.resolve(path)?;
        let mut file = match fs::File::open(&resolved).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VeilError::not_found(format!("no shared file {path}")).into())
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset)).await?;
        let len = usize::try_from(size)
            .map_err(|_| VeilError::validation(format!("chunk of {size} bytes too large")))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Collects a download in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contents(&self) -> Vec<u8> {
        self.data.lock().await.clone()
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), ClientError> {
        let start = usize::try_from(offset)
            .map_err(|_| VeilError::validation(format!("offset {offset} too large")))?;
        let end = start + data.len();
        let mut buf = self.data.lock().await;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Writes a download straight to disk at the chunk offsets.
pub struct FileSink {
    file: fs::File,
}

impl FileSink {
    /// Create (or truncate) `path` and size it to `size` bytes.
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self, ClientError> {
        let file = fs::File::create(path).await?;
        file.set_len(size).await?;
        Ok(Self { file })
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), ClientError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ClientError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}
