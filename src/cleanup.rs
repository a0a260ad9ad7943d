//! # Cleanup Module
//!
//! Rimozione di indici, rendition generate e file temporanei.
//!
//! ## Responsabilità:
//! - Cancellazione di tutti gli indici (e file) di un asset
//! - Cancellazione di tutti gli indici di una cartella di trasformazione, per tutti gli asset
//! - Cancellazione singola o batch di indici
//! - Pulizia dei file temporanei rimandati a fine richiesta
//!
//! Gli errori dello storage vengono solo loggati: la pulizia è best-effort.
//! Gli errori del repository degli indici invece vengono propagati.

use crate::error::Result;
use crate::index::record::{Asset, TransformIndex};
use crate::index::repository::IndexRepository;
use crate::pipeline::source::SourceCache;
use crate::volume::Volumes;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Cleanup {
    repository: Arc<dyn IndexRepository>,
    volumes: Volumes,
    sources: Arc<SourceCache>,
}

impl Cleanup {
    pub fn new(repository: Arc<dyn IndexRepository>, volumes: Volumes, sources: Arc<SourceCache>) -> Self {
        Self {
            repository,
            volumes,
            sources,
        }
    }

    /// Delete one index row and its generated file
    pub async fn delete_index(&self, index: &TransformIndex) -> Result<()> {
        self.delete_rendition_file(index).await;
        self.repository.delete(index.id).await
    }

    /// Delete files of every given index, then their rows in one batch
    pub async fn delete_indexes(&self, indexes: &[TransformIndex]) -> Result<usize> {
        if indexes.is_empty() {
            return Ok(0);
        }
        join_all(indexes.iter().map(|index| self.delete_rendition_file(index))).await;
        let ids: Vec<i64> = indexes.iter().map(|index| index.id).collect();
        let deleted = self.repository.delete_many(&ids).await?;
        debug!("Deleted {} transform indexes", deleted);
        Ok(deleted)
    }

    /// Remove every rendition of an asset along with its cached source copy
    pub async fn delete_asset_transforms(&self, asset: &Asset) -> Result<usize> {
        let indexes = self.repository.find_by_asset(asset.id).await?;
        let deleted = self.delete_indexes(&indexes).await?;
        self.sources.forget(asset).await;
        info!("Removed {} transforms of {}", deleted, asset.path());
        Ok(deleted)
    }

    /// Remove every rendition stored under a transform folder, for all assets
    pub async fn delete_transform_folder(&self, location: &str) -> Result<usize> {
        let indexes = self.repository.find_by_location(location).await?;
        let deleted = self.delete_indexes(&indexes).await?;
        if deleted > 0 {
            info!("Invalidated {} transform indexes in {}", deleted, location);
        }
        Ok(deleted)
    }

    /// Best-effort removal of temp files queued during generation
    pub async fn cleanup_deferred_sources(&self) -> usize {
        let removed = self.sources.cleanup_deferred().await;
        if removed > 0 {
            debug!("Removed {} deferred temp sources", removed);
        }
        removed
    }

    async fn delete_rendition_file(&self, index: &TransformIndex) {
        let volume = match self.volumes.get(&index.volume_id) {
            Ok(volume) => volume,
            Err(e) => {
                warn!("Cannot delete rendition of index {}: {}", index.id, e);
                return;
            }
        };
        let path = index.rendition_path();
        if let Err(e) = volume.delete_file(&path).await {
            warn!("Failed to delete rendition {}: {}", path, e);
        }
    }
}
