//! Output sinks: where reassembled bytes end up.
//!
//! [`FsSink`] writes below a root directory with `tokio::fs`; [`MemorySink`]
//! keeps files in memory for embedding and tests.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::error::DownloadError;

/// Sequential writer returned by [`Sink::open`].
#[async_trait]
pub trait SinkWriter: Send {
    /// Appends `data`.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), DownloadError>;

    /// Pushes buffered bytes to storage.
    async fn flush(&mut self) -> Result<(), DownloadError>;
}

/// Storage for download output, addressed by paths relative to the sink.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Opens `path` for sequential writing; `resume` appends to existing data.
    ///
    /// Returns [`DownloadError::SinkUnavailable`] when the sink itself cannot
    /// be used and [`DownloadError::Io`] for file-level failures.
    async fn open(&self, path: &Path, resume: bool) -> Result<Box<dyn SinkWriter>, DownloadError>;

    /// Whether `path` currently exists.
    async fn exists(&self, path: &Path) -> bool;

    /// Deletes `path`; a missing file is not an error.
    async fn delete(&self, path: &Path) -> Result<(), DownloadError>;

    /// Current length of `path`, or 0 when it does not exist.
    async fn length(&self, path: &Path) -> Result<u64, DownloadError>;
}

/// File-system sink rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    /// Creates a sink writing below `root`. The directory is created on first open.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `path`.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    async fn ensure_root(&self) -> Result<(), DownloadError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(DownloadError::sink_unavailable(
                &self.root,
                "exists and is not a directory",
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| DownloadError::sink_unavailable(&self.root, e.to_string())),
            Err(e) => Err(DownloadError::sink_unavailable(&self.root, e.to_string())),
        }
    }
}

struct FsWriter {
    path: PathBuf,
    inner: BufWriter<File>,
}

#[async_trait]
impl SinkWriter for FsWriter {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        self.inner
            .write_all(data)
            .await
            .map_err(|e| DownloadError::io(self.path.clone(), e))
    }

    async fn flush(&mut self) -> Result<(), DownloadError> {
        self.inner
            .flush()
            .await
            .map_err(|e| DownloadError::io(self.path.clone(), e))
    }
}

#[async_trait]
impl Sink for FsSink {
    #[instrument(level = "debug", skip(self), fields(root = %self.root.display()))]
    async fn open(&self, path: &Path, resume: bool) -> Result<Box<dyn SinkWriter>, DownloadError> {
        self.ensure_root().await?;
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::sink_unavailable(parent, e.to_string()))?;
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if resume {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options
            .open(&full)
            .await
            .map_err(|e| DownloadError::io(full.clone(), e))?;
        debug!(path = %full.display(), resume, "opened output file");

        Ok(Box::new(FsWriter {
            path: full,
            inner: BufWriter::new(file),
        }))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .unwrap_or(false)
    }

    async fn delete(&self, path: &Path) -> Result<(), DownloadError> {
        let full = self.resolve(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {
                debug!(path = %full.display(), "deleted output file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::io(full, e)),
        }
    }

    async fn length(&self, path: &Path) -> Result<u64, DownloadError> {
        let full = self.resolve(path);
        match tokio::fs::metadata(&full).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(DownloadError::io(full, e)),
        }
    }
}

type MemoryFiles = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

/// In-memory sink.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    files: MemoryFiles,
    fail_writes: Arc<AtomicBool>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with an IO error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Contents of `path`.
    pub async fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().await.get(path).cloned()
    }

    /// Seeds `path` with `data`, as if left behind by an earlier attempt.
    pub async fn insert(&self, path: &Path, data: Vec<u8>) {
        self.files.lock().await.insert(path.to_path_buf(), data);
    }
}

struct MemoryWriter {
    path: PathBuf,
    files: MemoryFiles,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl SinkWriter for MemoryWriter {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DownloadError::io(
                self.path.clone(),
                std::io::Error::new(ErrorKind::StorageFull, "no space left on device"),
            ));
        }
        let mut files = self.files.lock().await;
        let Some(buf) = files.get_mut(&self.path) else {
            return Err(DownloadError::io(
                self.path.clone(),
                std::io::Error::new(ErrorKind::NotFound, "file was deleted"),
            ));
        };
        buf.extend_from_slice(data);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DownloadError> {
        Ok(())
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn open(&self, path: &Path, resume: bool) -> Result<Box<dyn SinkWriter>, DownloadError> {
        let mut files = self.files.lock().await;
        let entry = files.entry(path.to_path_buf()).or_default();
        if !resume {
            entry.clear();
        }
        Ok(Box::new(MemoryWriter {
            path: path.to_path_buf(),
            files: Arc::clone(&self.files),
            fail_writes: Arc::clone(&self.fail_writes),
        }))
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files.lock().await.contains_key(path)
    }

    async fn delete(&self, path: &Path) -> Result<(), DownloadError> {
        self.files.lock().await.remove(path);
        Ok(())
    }

    async fn length(&self, path: &Path) -> Result<u64, DownloadError> {
        Ok(self
            .files
            .lock()
            .await
            .get(path)
            .map_or(0, |buf| buf.len() as u64))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_sink_write_resume_and_delete() {
        let temp = TempDir::new().unwrap();
        let sink = FsSink::new(temp.path().join("out"));
        let name = Path::new("video.mp4");

        let mut writer = sink.open(name, false).await.unwrap();
        writer.write_all(b"hello ").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);
        assert_eq!(sink.length(name).await.unwrap(), 6);

        let mut writer = sink.open(name, true).await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let bytes = std::fs::read(sink.resolve(name)).unwrap();
        assert_eq!(bytes, b"hello world");
        assert!(sink.exists(name).await);

        sink.delete(name).await.unwrap();
        assert!(!sink.exists(name).await);
        assert_eq!(sink.length(name).await.unwrap(), 0);
        sink.delete(name).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_sink_truncates_without_resume() {
        let temp = TempDir::new().unwrap();
        let sink = FsSink::new(temp.path());
        let name = Path::new("a.bin");
        std::fs::write(temp.path().join(name), b"stale data").unwrap();

        let mut writer = sink.open(name, false).await.unwrap();
        writer.write_all(b"new").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);
        assert_eq!(std::fs::read(temp.path().join(name)).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_fs_sink_root_is_a_file_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let sink = FsSink::new(&blocker);

        let result = sink.open(Path::new("a.bin"), false).await;
        assert!(matches!(result, Err(DownloadError::SinkUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_memory_sink_failing_writes() {
        let sink = MemorySink::new();
        let name = Path::new("a.bin");
        let mut writer = sink.open(name, false).await.unwrap();
        writer.write_all(b"ok").await.unwrap();
        sink.fail_writes(true);
        let err = writer.write_all(b"boom").await.unwrap_err();
        assert!(err.is_sink_error());
        assert_eq!(sink.contents(name).await.unwrap(), b"ok");
    }
}
