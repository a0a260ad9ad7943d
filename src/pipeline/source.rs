//! # Source Acquisition
//!
//! Fornisce alla pipeline un path locale leggibile per l'originale di un asset.
//!
//! ## Strategia:
//! - Volume locale: usa direttamente il file del volume
//! - Volume remoto: scarica in un file temporaneo (0 byte o mancante → `SourceUnavailable`)
//! - Se `max_cached_cloud_image_size > 0` tiene in cache una copia ridotta e rimanda
//!   la cancellazione del temporaneo a fine richiesta (`cleanup_deferred`)
//! - Altrimenti il temporaneo stesso diventa la copia in cache
//!
//! ## Struttura cache:
//! ```text
//! <cache_dir>/
//! ├── sources/   copie locali di sorgenti remote (<hash>-<asset_id>.<ext>)
//! └── temp/      download e render temporanei
//! ```

use crate::config::Config;
use crate::error::{Result, TransformError};
use crate::image_processor::ImageEngine;
use crate::index::record::Asset;
use crate::volume::Volume;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tracing::{debug, warn};

pub struct SourceCache {
    sources_dir: PathBuf,
    temp_dir: PathBuf,
    max_cached_size: u32,
    engine: Arc<dyn ImageEngine>,
    deferred: Mutex<Vec<PathBuf>>,
}

impl SourceCache {
    pub fn new(config: &Config, engine: Arc<dyn ImageEngine>) -> Self {
        let cache_dir = config.resolved_cache_dir();
        Self {
            sources_dir: cache_dir.join("sources"),
            temp_dir: cache_dir.join("temp"),
            max_cached_size: config.max_cached_cloud_image_size,
            engine,
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Local cache location of a remote asset's source; changes when the asset changes
    pub fn cache_path(&self, asset: &Asset) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}:{}", asset.volume_id, asset.path(), asset.date_modified.timestamp()).as_bytes());
        let hash = hex::encode(hasher.finalize())[..16].to_string();
        let extension = asset.extension();
        self.sources_dir.join(format!("{}-{}.{}", hash, asset.id, extension))
    }

    /// Path of a locally readable copy of the asset's source file
    pub async fn local_source(&self, asset: &Asset, volume: &dyn Volume) -> Result<PathBuf> {
        if volume.is_local() {
            let path = volume
                .local_path(&asset.path())
                .ok_or_else(|| TransformError::SourceUnavailable(asset.path()))?;
            if !fs::try_exists(&path).await? {
                return Err(TransformError::SourceUnavailable(format!("{} does not exist", path.display())));
            }
            return Ok(path);
        }

        let cached = self.cache_path(asset);
        if fs::try_exists(&cached).await? {
            debug!("Using cached source {}", cached.display());
            return Ok(cached);
        }

        let temp = self.download(asset, volume).await?;
        fs::create_dir_all(&self.sources_dir).await?;

        if self.max_cached_size > 0 && self.engine.supports_output(&asset.extension()) {
            let engine = self.engine.clone();
            let (from, to, max) = (temp.clone(), cached.clone(), self.max_cached_size);
            let resized = tokio::task::spawn_blocking(move || -> Result<bool> {
                let mut image = engine.load(&from)?;
                if image.width() <= max && image.height() <= max {
                    return Ok(false);
                }
                image.scale_to_fit(Some(max), Some(max))?;
                image.save_as(&to)?;
                Ok(true)
            })
            .await
            .map_err(|e| TransformError::GenerationFailed(format!("source resize task failed: {}", e)))??;

            if resized {
                debug!("Cached {}px copy of {} at {}", max, asset.path(), cached.display());
                self.defer(temp);
                return Ok(cached);
            }
        }

        fs::rename(&temp, &cached).await?;
        Ok(cached)
    }

    async fn download(&self, asset: &Asset, volume: &dyn Volume) -> Result<PathBuf> {
        fs::create_dir_all(&self.temp_dir).await?;
        let temp = tempfile::Builder::new()
            .prefix("source-")
            .suffix(&format!(".{}", asset.extension()))
            .tempfile_in(&self.temp_dir)?
            .into_temp_path()
            .keep()
            .map_err(|e| TransformError::Io(e.error))?;

        let result = async {
            let mut stream = volume.read_stream(&asset.path()).await?;
            let mut file = fs::File::create(&temp).await?;
            let bytes = tokio::io::copy(&mut stream, &mut file).await?;
            Ok::<u64, TransformError>(bytes)
        }
        .await;

        match result {
            Ok(0) => {
                remove_quietly(&temp).await;
                Err(TransformError::SourceUnavailable(format!("{} downloaded as 0 bytes", asset.path())))
            }
            Ok(bytes) => {
                debug!("Downloaded {} ({} bytes) to {}", asset.path(), bytes, temp.display());
                Ok(temp)
            }
            Err(e) => {
                remove_quietly(&temp).await;
                Err(TransformError::SourceUnavailable(format!("{}: {}", asset.path(), e)))
            }
        }
    }

    fn defer(&self, path: PathBuf) {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner).push(path);
    }

    /// Remove temp files whose deletion was postponed; returns how many were removed
    pub async fn cleanup_deferred(&self) -> usize {
        let pending: Vec<PathBuf> = std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner));
        let mut removed = 0;
        for path in pending {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove temp source {}: {}", path.display(), e),
            }
        }
        removed
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop the cached copy of an asset's source
    pub async fn forget(&self, asset: &Asset) {
        remove_quietly(&self.cache_path(asset)).await;
    }
}

pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
