//! # Transform Service
//!
//! Punto d'ingresso del sottosistema: collega store delle definizioni, cache
//! degli indici, coordinatore di generazione e cleanup.
//!
//! ## API principali:
//! - `url_for(asset, input)`: URL della rendition (generata subito o differita)
//! - `generate_deferred(asset, index_id)`: serve un URL differito
//! - `srcset(asset, input, sizes)`: stringa `srcset` da dimensioni relative
//! - `eager_load(assets, inputs)`: pre-caricamento batch per una richiesta
//! - `delete_asset()` / `delete_index()`: pulizia e retry di indici falliti
//! - `end_request()`: chiude lo scope di richiesta
//!
//! ## Esempio:
//! ```rust,ignore
//! let service = TransformService::builder(config)
//!     .volume(Arc::new(LocalVolume::new("uploads", "/srv/uploads", "/uploads")))
//!     .build()
//!     .await?;
//! let url = service.url_for(&asset, &TransformInput::from("thumb")).await?;
//! ```

use crate::cleanup::Cleanup;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Result, TransformError};
use crate::events::TransformEvents;
use crate::generator::{GenerationCoordinator, Rendition, TokioWait, WaitStrategy};
use crate::image_processor::{ImageEngine, RasterEngine};
use crate::index::cache::IndexCache;
use crate::index::record::{Asset, TransformIndex};
use crate::index::repository::{IndexRepository, InMemoryIndexRepository};
use crate::pipeline::source::SourceCache;
use crate::pipeline::ImagePipeline;
use crate::project_config::ProjectConfig;
use crate::transform::spec::{normalize, resolve_relative, TransformInput};
use crate::transform::store::DefinitionStore;
use crate::volume::{Volume, Volumes};
use std::sync::Arc;
use tracing::debug;

pub struct TransformService {
    config: Config,
    repository: Arc<dyn IndexRepository>,
    definitions: DefinitionStore,
    cache: IndexCache,
    coordinator: GenerationCoordinator,
    cleanup: Arc<Cleanup>,
    events: TransformEvents,
}

pub struct TransformServiceBuilder {
    config: Config,
    volumes: Volumes,
    engine: Option<Arc<dyn ImageEngine>>,
    repository: Option<Arc<dyn IndexRepository>>,
    project_config: Option<Arc<ProjectConfig>>,
    clock: Option<Arc<dyn Clock>>,
    wait: Option<Arc<dyn WaitStrategy>>,
}

impl TransformServiceBuilder {
    pub fn volume(mut self, volume: Arc<dyn Volume>) -> Self {
        self.volumes.register(volume);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ImageEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn IndexRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn project_config(mut self, project_config: Arc<ProjectConfig>) -> Self {
        self.project_config = Some(project_config);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn wait_strategy(mut self, wait: Arc<dyn WaitStrategy>) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Wire every component and load the definitions already in the project config
    pub async fn build(self) -> Result<TransformService> {
        self.config
            .validate()
            .map_err(|e| TransformError::Config(e.to_string()))?;

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let engine = self.engine.unwrap_or_else(|| Arc::new(RasterEngine::new()));
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryIndexRepository::new(clock.clone())));
        let project_config = self.project_config.unwrap_or_default();
        let wait = self.wait.unwrap_or_else(|| Arc::new(TokioWait));
        let volumes = self.volumes;

        let sources = Arc::new(SourceCache::new(&config, engine.clone()));
        let cleanup = Arc::new(Cleanup::new(repository.clone(), volumes.clone(), sources.clone()));
        let events = TransformEvents::new();
        let definitions = DefinitionStore::new(project_config, events.clone(), clock.clone(), cleanup.clone());
        definitions.load().await?;

        let cache = IndexCache::new(repository.clone(), definitions.clone(), cleanup.clone(), clock.clone());
        let pipeline = ImagePipeline::new(
            engine,
            volumes.clone(),
            repository.clone(),
            definitions.clone(),
            sources,
            events.clone(),
            config.default_image_quality,
            config.upscale_images,
        );
        let coordinator = GenerationCoordinator::new(
            repository.clone(),
            pipeline,
            volumes,
            clock,
            wait,
            config.poll_interval(),
            config.max_poll_attempts,
            config.stale_after(),
        );

        Ok(TransformService {
            config,
            repository,
            definitions,
            cache,
            coordinator,
            cleanup,
            events,
        })
    }
}

impl TransformService {
    pub fn builder(config: Config) -> TransformServiceBuilder {
        TransformServiceBuilder {
            config,
            volumes: Volumes::new(),
            engine: None,
            repository: None,
            project_config: None,
            clock: None,
            wait: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn definitions(&self) -> &DefinitionStore {
        &self.definitions
    }

    pub fn events(&self) -> &TransformEvents {
        &self.events
    }

    pub fn index_cache(&self) -> &IndexCache {
        &self.cache
    }

    pub fn coordinator(&self) -> &GenerationCoordinator {
        &self.coordinator
    }

    /// URL of a transformed asset; deferred when inline generation is disabled
    pub async fn url_for(&self, asset: &Asset, input: &TransformInput) -> Result<String> {
        let spec = normalize(input, &self.definitions)?;
        let index = self.cache.resolve_or_create(asset, &spec).await?;

        if !index.file_exists && !self.config.generate_transforms_before_page_load {
            return Ok(self.deferred_url(&index));
        }
        Ok(self.finish(asset, &index).await?.url)
    }

    /// Generate the rendition now, whatever the deferral setting
    pub async fn rendition(&self, asset: &Asset, input: &TransformInput) -> Result<Rendition> {
        let spec = normalize(input, &self.definitions)?;
        let index = self.cache.resolve_or_create(asset, &spec).await?;
        self.finish(asset, &index).await
    }

    /// Serve a deferred URL: generate the index and return the final URL
    pub async fn generate_deferred(&self, asset: &Asset, index_id: i64) -> Result<String> {
        let index = self
            .repository
            .find_by_id(index_id)
            .await?
            .filter(|index| index.asset_id == asset.id)
            .ok_or_else(|| {
                TransformError::IndexResolutionFailed(format!("no transform index {} for asset {}", index_id, asset.id))
            })?;
        Ok(self.finish(asset, &index).await?.url)
    }

    /// `srcset` value for `sizes` such as `1x`, `2x` or `800w`
    pub async fn srcset(&self, asset: &Asset, input: &TransformInput, sizes: &[&str]) -> Result<String> {
        let reference = normalize(input, &self.definitions)?;
        let mut entries = Vec::with_capacity(sizes.len());
        for size in sizes {
            let spec = resolve_relative(&reference, size)?;
            let index = self.cache.resolve_or_create(asset, &spec).await?;
            let url = if !index.file_exists && !self.config.generate_transforms_before_page_load {
                self.deferred_url(&index)
            } else {
                self.finish(asset, &index).await?.url
            };
            entries.push(format!("{} {}", url, size.trim()));
        }
        Ok(entries.join(", "))
    }

    pub async fn eager_load(&self, assets: &[Asset], inputs: &[TransformInput]) -> Result<Vec<TransformIndex>> {
        self.cache.eager_load(assets, inputs).await
    }

    /// Drop every rendition of an asset
    pub async fn delete_asset(&self, asset: &Asset) -> Result<usize> {
        self.cache.forget_asset(asset.id);
        self.cleanup.delete_asset_transforms(asset).await
    }

    /// Delete one index; the only way to retry a failed generation
    pub async fn delete_index(&self, index_id: i64) -> Result<()> {
        if let Some(index) = self.repository.find_by_id(index_id).await? {
            self.cache.forget_asset(index.asset_id);
            self.cleanup.delete_index(&index).await?;
        }
        Ok(())
    }

    /// End of the request scope: drop eager-loaded indexes and deferred temp files
    pub async fn end_request(&self) {
        self.cache.clear_eager_loaded();
        self.cleanup.cleanup_deferred_sources().await;
    }

    fn deferred_url(&self, index: &TransformIndex) -> String {
        debug!("Deferring generation of transform index {}", index.id);
        format!("{}?transformId={}", self.config.deferred_url_prefix, index.id)
    }

    async fn finish(&self, asset: &Asset, index: &TransformIndex) -> Result<Rendition> {
        let rendition = self.coordinator.ensure_generated(asset, index).await?;
        self.cache.remember(&rendition.index);
        Ok(rendition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use crate::transform::definition::TransformDefinition;
    use crate::volume::LocalVolume;
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_url_for_named_transform() {
        let harness = Harness::new().await;
        harness
            .service
            .definitions()
            .save(&TransformDefinition {
                width: Some(300),
                height: Some(200),
                ..TransformDefinition::new("Thumb", "thumb")
            })
            .await
            .unwrap();

        let asset = harness.remote_asset(1, "photo.jpg");
        let url = harness.service.url_for(&asset, &TransformInput::from("thumb")).await.unwrap();
        assert_eq!(url, "https://cdn.test/photos/_thumb/photo.jpg");
        assert!(harness.volume.get("photos/_thumb/photo.jpg").is_some());

        assert!(matches!(
            harness.service.url_for(&asset, &TransformInput::from("missing")).await,
            Err(TransformError::DefinitionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deferred_url_then_generate() {
        let mut harness = Harness::new().await;
        harness.config.generate_transforms_before_page_load = false;
        let harness = harness.rebuild().await;

        let asset = harness.remote_asset(1, "photo.jpg");
        let input = TransformInput::ByProperties(json!({"width": 120}).as_object().unwrap().clone());
        let url = harness.service.url_for(&asset, &input).await.unwrap();
        let index = harness.repository.find_by_asset(asset.id).await.unwrap().remove(0);
        assert_eq!(url, format!("/actions/assets/generate-transform?transformId={}", index.id));
        assert_eq!(harness.engine.render_count(), 0);

        let final_url = harness.service.generate_deferred(&asset, index.id).await.unwrap();
        assert_eq!(final_url, "https://cdn.test/photos/_120xAUTO_crop_center-center_none/photo.jpg");

        // once generated the direct URL is returned
        assert_eq!(harness.service.url_for(&asset, &input).await.unwrap(), final_url);
        assert!(harness.service.generate_deferred(&asset, 9999).await.is_err());
    }

    #[tokio::test]
    async fn test_srcset() {
        let harness = Harness::new().await;
        let asset = harness.remote_asset(1, "photo.jpg");
        let input = TransformInput::ByProperties(json!({"width": 100, "height": 60}).as_object().unwrap().clone());

        let srcset = harness.service.srcset(&asset, &input, &["1x", "2x", "300w"]).await.unwrap();
        assert_eq!(
            srcset,
            "https://cdn.test/photos/_100x60_crop_center-center_none/photo.jpg 1x, \
             https://cdn.test/photos/_200x120_crop_center-center_none/photo.jpg 2x, \
             https://cdn.test/photos/_300x180_crop_center-center_none/photo.jpg 300w"
        );
    }

    #[tokio::test]
    async fn test_failed_index_retried_after_delete() {
        let harness = Harness::new().await;
        let asset = harness.remote_asset(1, "photo.jpg");
        let input = TransformInput::ByProperties(json!({"width": 10}).as_object().unwrap().clone());

        harness.engine.set_fail(true);
        assert!(harness.service.url_for(&asset, &input).await.is_err());
        // the failure sticks until the index is removed
        harness.engine.set_fail(false);
        assert!(harness.service.url_for(&asset, &input).await.is_err());

        let failed = harness.repository.find_by_asset(asset.id).await.unwrap().remove(0);
        harness.service.delete_index(failed.id).await.unwrap();
        assert!(harness.service.url_for(&asset, &input).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_asset_cascades() {
        let harness = Harness::new().await;
        let asset = harness.remote_asset(1, "photo.jpg");
        for width in [10, 20] {
            let input = TransformInput::ByProperties(json!({ "width": width }).as_object().unwrap().clone());
            harness.service.url_for(&asset, &input).await.unwrap();
        }
        assert_eq!(harness.volume.paths().len(), 3);

        assert_eq!(harness.service.delete_asset(&asset).await.unwrap(), 2);
        assert!(harness.repository.is_empty());
        assert_eq!(harness.volume.paths(), vec!["photos/photo.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_end_request_clears_eager_map() {
        let harness = Harness::new().await;
        let assets = vec![harness.remote_asset(1, "a.jpg"), harness.remote_asset(2, "b.jpg")];
        let inputs = vec![TransformInput::ByProperties(json!({"width": 10}).as_object().unwrap().clone())];

        assert_eq!(harness.service.eager_load(&assets, &inputs).await.unwrap().len(), 2);
        assert_eq!(harness.service.index_cache().eager_loaded_count(), 2);
        harness.service.end_request().await;
        assert_eq!(harness.service.index_cache().eager_loaded_count(), 0);
    }

    #[tokio::test]
    async fn test_local_volume_with_raster_engine() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("uploads");
        std::fs::create_dir_all(root.join("blog")).unwrap();
        RgbImage::from_pixel(80, 40, Rgb([200, 10, 10]))
            .save(root.join("blog/red.png"))
            .unwrap();

        let config = Config {
            cache_dir: Some(temp_dir.path().join("cache")),
            ..Default::default()
        };
        let service = TransformService::builder(config)
            .volume(Arc::new(LocalVolume::new("uploads", &root, "/uploads")))
            .build()
            .await
            .unwrap();

        let asset = Asset::new(1, "uploads", "blog", "red.png", chrono::Utc::now() - chrono::Duration::hours(1));
        let input = TransformInput::ByProperties(json!({"width": 20, "height": 20}).as_object().unwrap().clone());
        let url = service.url_for(&asset, &input).await.unwrap();
        assert_eq!(url, "/uploads/blog/_20x20_crop_center-center_none/red.png");

        let generated = image::open(root.join("blog/_20x20_crop_center-center_none/red.png")).unwrap();
        assert_eq!((generated.width(), generated.height()), (20, 20));
    }
}
