//! # Volume Module
//!
//! Astrazione dello storage in cui vivono gli asset e le rendition generate.
//!
//! ## Responsabilità:
//! - Trait `Volume`: exists / date_modified / copy / delete / read / write da stream / URL
//! - Marker `is_local()` + `local_path()` per evitare download temporanei da volumi locali
//! - `LocalVolume`: filesystem locale con `tokio::fs`
//! - `MemoryVolume`: volume non locale in memoria (si comporta come uno storage remoto)
//! - `Volumes`: registro dei volumi per id
//!
//! I path sono relativi alla radice del volume e usano `/` come separatore.

use crate::error::{Result, TransformError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// File storage capability
#[async_trait]
pub trait Volume: Send + Sync {
    fn id(&self) -> &str;

    /// Volumes whose files are directly readable from the local filesystem
    fn is_local(&self) -> bool {
        false
    }

    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }

    async fn file_exists(&self, path: &str) -> Result<bool>;

    async fn date_modified(&self, path: &str) -> Result<Option<DateTime<Utc>>>;

    async fn copy_file(&self, from: &str, to: &str) -> Result<()>;

    /// Delete a file; deleting a missing file is not an error
    async fn delete_file(&self, path: &str) -> Result<()>;

    async fn read_stream(&self, path: &str) -> Result<ByteStream>;

    async fn write_file_from_stream(&self, path: &str, stream: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64>;

    fn build_url(&self, path: &str) -> String;
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Volume backed by a directory on the local filesystem
pub struct LocalVolume {
    id: String,
    root: PathBuf,
    base_url: String,
}

impl LocalVolume {
    pub fn new(id: &str, root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            id: id.to_string(),
            root: root.into(),
            base_url: base_url.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(TransformError::Storage(format!("path escapes volume root: {}", path)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Volume for LocalVolume {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_local(&self) -> bool {
        true
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.resolve(path).ok()
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.resolve(path)?).await?)
    }

    async fn date_modified(&self, path: &str) -> Result<Option<DateTime<Utc>>> {
        match fs::metadata(self.resolve(path)?).await {
            Ok(metadata) => Ok(Some(DateTime::<Utc>::from(metadata.modified()?))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(self.resolve(from)?, &target).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream> {
        let file = fs::File::open(self.resolve(path)?).await.map_err(|e| {
            TransformError::SourceUnavailable(format!("{}: {}", path, e))
        })?;
        Ok(Box::new(file))
    }

    async fn write_file_from_stream(&self, path: &str, stream: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&target).await?;
        let written = tokio::io::copy(stream, &mut file).await?;
        debug!("Wrote {} bytes to {}", written, target.display());
        Ok(written)
    }

    fn build_url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

/// Non-local volume keeping files in memory
pub struct MemoryVolume {
    id: String,
    base_url: String,
    files: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
    read_only: AtomicBool,
}

impl MemoryVolume {
    pub fn new(id: &str, base_url: &str) -> Self {
        Self {
            id: id.to_string(),
            base_url: base_url.to_string(),
            files: Mutex::new(HashMap::new()),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn put(&self, path: &str, bytes: Vec<u8>) {
        self.lock().insert(normalize(path), (bytes, Utc::now()));
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().get(&normalize(path)).map(|(bytes, _)| bytes.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Make every write fail, to exercise storage error handling
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(TransformError::Storage(format!("volume {} is read-only", self.id)));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Vec<u8>, DateTime<Utc>)>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

#[async_trait]
impl Volume for MemoryVolume {
    fn id(&self) -> &str {
        &self.id
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.lock().contains_key(&normalize(path)))
    }

    async fn date_modified(&self, path: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock().get(&normalize(path)).map(|(_, modified)| *modified))
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        self.check_writable()?;
        let mut files = self.lock();
        let entry = files
            .get(&normalize(from))
            .cloned()
            .ok_or_else(|| TransformError::Storage(format!("file not found: {}", from)))?;
        files.insert(normalize(to), (entry.0, Utc::now()));
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        self.lock().remove(&normalize(path));
        Ok(())
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream> {
        let bytes = self
            .get(path)
            .ok_or_else(|| TransformError::SourceUnavailable(format!("file not found: {}", path)))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn write_file_from_stream(&self, path: &str, stream: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        self.check_writable()?;
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await?;
        let written = bytes.len() as u64;
        self.put(path, bytes);
        Ok(written)
    }

    fn build_url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

/// Registry of volumes by id
#[derive(Clone, Default)]
pub struct Volumes {
    volumes: HashMap<String, Arc<dyn Volume>>,
}

impl Volumes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, volume: Arc<dyn Volume>) -> Self {
        self.register(volume);
        self
    }

    pub fn register(&mut self, volume: Arc<dyn Volume>) {
        self.volumes.insert(volume.id().to_string(), volume);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Volume>> {
        self.volumes
            .get(id)
            .cloned()
            .ok_or_else(|| TransformError::Storage(format!("unknown volume '{}'", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_volume_operations() {
        let temp_dir = TempDir::new().unwrap();
        let volume = LocalVolume::new("local", temp_dir.path(), "https://cdn.test/uploads/");

        let mut data: &[u8] = b"hello";
        let written = volume.write_file_from_stream("a/b/c.txt", &mut data).await.unwrap();
        assert_eq!(written, 5);
        assert!(volume.file_exists("a/b/c.txt").await.unwrap());
        assert!(volume.date_modified("a/b/c.txt").await.unwrap().is_some());

        volume.copy_file("a/b/c.txt", "d/e.txt").await.unwrap();
        let mut copied = String::new();
        volume.read_stream("d/e.txt").await.unwrap().read_to_string(&mut copied).await.unwrap();
        assert_eq!(copied, "hello");

        volume.delete_file("d/e.txt").await.unwrap();
        volume.delete_file("d/e.txt").await.unwrap();
        assert!(!volume.file_exists("d/e.txt").await.unwrap());
        assert_eq!(volume.date_modified("d/e.txt").await.unwrap(), None);

        assert_eq!(volume.build_url("a/b/c.txt"), "https://cdn.test/uploads/a/b/c.txt");
        assert!(volume.is_local());
    }

    #[tokio::test]
    async fn test_local_volume_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let volume = LocalVolume::new("local", temp_dir.path(), "/");
        assert!(volume.file_exists("../etc/passwd").await.is_err());
        assert!(volume.local_path("../x").is_none());
    }

    #[tokio::test]
    async fn test_memory_volume() {
        let volume = MemoryVolume::new("s3", "https://bucket.test");
        assert!(!volume.is_local());
        assert!(volume.local_path("x").is_none());

        volume.put("/photos/a.jpg", vec![1, 2, 3]);
        assert!(volume.file_exists("photos/a.jpg").await.unwrap());
        volume.copy_file("photos/a.jpg", "photos/_thumb/a.jpg").await.unwrap();
        assert_eq!(volume.get("photos/_thumb/a.jpg"), Some(vec![1, 2, 3]));

        volume.set_read_only(true);
        let mut data: &[u8] = b"x";
        assert!(volume.write_file_from_stream("b.jpg", &mut data).await.is_err());
        assert!(matches!(
            volume.read_stream("missing.jpg").await,
            Err(TransformError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn test_registry() {
        let volumes = Volumes::new().with(Arc::new(MemoryVolume::new("s3", "/")));
        assert!(volumes.get("s3").is_ok());
        assert!(matches!(volumes.get("nope"), Err(TransformError::Storage(_))));
    }
}
