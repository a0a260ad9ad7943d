//! # Generation Coordinator
//!
//! Garantisce che la rendition di un indice esista, coordinando più worker
//! concorrenti tramite la riga persistita.
//!
//! ## Protocollo:
//! - `error` sulla riga → fallimento immediato (si ritenta solo cancellando l'indice)
//! - `file_exists` → URL della rendition
//! - riga libera → `try_claim` (compare-and-set su `in_progress`), poi pipeline
//! - riga in lavorazione → polling con `WaitStrategy`; se `date_updated` è più
//!   vecchia di `stale_after` il worker viene considerato morto e la riga
//!   viene rilevata con `take_over` (compare-and-set su `date_updated`)
//! - tentativi di polling esauriti → ultimo `take_over`, altrimenti `GenerationFailed`

use crate::clock::Clock;
use crate::error::{Result, TransformError};
use crate::index::record::{Asset, TransformIndex};
use crate::index::repository::IndexRepository;
use crate::pipeline::ImagePipeline;
use crate::volume::Volumes;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How the coordinator waits between polls
#[async_trait]
pub trait WaitStrategy: Send + Sync {
    async fn sleep(&self, interval: Duration);
}

pub struct TokioWait;

#[async_trait]
impl WaitStrategy for TokioWait {
    async fn sleep(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

/// A generated rendition and its public URL
#[derive(Debug, Clone, PartialEq)]
pub struct Rendition {
    pub index: TransformIndex,
    pub url: String,
}

pub struct GenerationCoordinator {
    repository: Arc<dyn IndexRepository>,
    pipeline: ImagePipeline,
    volumes: Volumes,
    clock: Arc<dyn Clock>,
    wait: Arc<dyn WaitStrategy>,
    poll_interval: Duration,
    max_poll_attempts: u32,
    stale_after: chrono::Duration,
}

impl GenerationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn IndexRepository>,
        pipeline: ImagePipeline,
        volumes: Volumes,
        clock: Arc<dyn Clock>,
        wait: Arc<dyn WaitStrategy>,
        poll_interval: Duration,
        max_poll_attempts: u32,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            repository,
            pipeline,
            volumes,
            clock,
            wait,
            poll_interval,
            max_poll_attempts,
            stale_after,
        }
    }

    pub fn pipeline(&self) -> &ImagePipeline {
        &self.pipeline
    }

    /// Make sure the rendition of `index` exists and return it with its URL
    pub async fn ensure_generated(&self, asset: &Asset, index: &TransformIndex) -> Result<Rendition> {
        if index.file_exists {
            return self.rendition(index.clone());
        }

        let mut row = self.fetch(index.id).await?;
        let mut attempts = 0;

        loop {
            if row.error {
                return Err(TransformError::GenerationFailed(format!(
                    "transform index {} previously failed",
                    row.id
                )));
            }
            if row.file_exists {
                return self.rendition(row);
            }

            if !row.in_progress {
                match self.repository.try_claim(row.id).await? {
                    Some(claimed) => {
                        debug!("Claimed transform index {}", claimed.id);
                        return self.generate(asset, claimed).await;
                    }
                    None => {
                        row = self.fetch(row.id).await?;
                        continue;
                    }
                }
            }

            if attempts >= self.max_poll_attempts {
                warn!(
                    "Transform index {} still in progress after {} polls, taking over",
                    row.id, attempts
                );
                return match self.repository.take_over(row.id, row.date_updated).await? {
                    Some(taken) => self.generate(asset, taken).await,
                    None => Err(TransformError::GenerationFailed(format!(
                        "gave up waiting for transform index {}",
                        row.id
                    ))),
                };
            }

            self.wait.sleep(self.poll_interval).await;
            attempts += 1;
            row = self.fetch(row.id).await?;

            if row.in_progress && !row.error && self.clock.now() - row.date_updated > self.stale_after {
                warn!(
                    "Transform index {} abandoned since {}, taking over",
                    row.id, row.date_updated
                );
                if let Some(taken) = self.repository.take_over(row.id, row.date_updated).await? {
                    return self.generate(asset, taken).await;
                }
                row = self.fetch(row.id).await?;
            }
        }
    }

    /// Public URL of a generated rendition
    pub fn url_for_index(&self, index: &TransformIndex) -> Result<String> {
        let volume = self.volumes.get(&index.volume_id)?;
        Ok(volume.build_url(&index.rendition_path()))
    }

    async fn generate(&self, asset: &Asset, claimed: TransformIndex) -> Result<Rendition> {
        let mut working = claimed;

        match self.pipeline.generate(asset, &mut working).await {
            Ok(outcome) => {
                working.file_exists = true;
                working.in_progress = false;
                working.error = false;
                let saved = self.repository.update(&working).await?;
                info!("Transform index {} ready ({:?})", saved.id, outcome);
                self.rendition(saved)
            }
            Err(e) => {
                error!("Failed to generate transform index {}: {}", working.id, e);
                working.file_exists = false;
                working.in_progress = false;
                working.error = true;
                if let Err(store_error) = self.repository.update(&working).await {
                    error!("Failed to record failure of index {}: {}", working.id, store_error);
                }
                Err(match e {
                    TransformError::UnsupportedFormat(_)
                    | TransformError::SourceUnavailable(_)
                    | TransformError::DefinitionNotFound(_)
                    | TransformError::GenerationFailed(_) => e,
                    other => TransformError::GenerationFailed(other.to_string()),
                })
            }
        }
    }

    async fn fetch(&self, id: i64) -> Result<TransformIndex> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| TransformError::GenerationFailed(format!("transform index {} was deleted", id)))
    }

    fn rendition(&self, index: TransformIndex) -> Result<Rendition> {
        let url = self.url_for_index(&index)?;
        Ok(Rendition { index, url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use crate::transform::spec::TransformSpec;

    async fn pending(harness: &Harness) -> (Asset, TransformIndex) {
        let asset = harness.remote_asset(1, "photo.jpg");
        let index = harness
            .service
            .index_cache()
            .resolve_or_create(&asset, &TransformSpec::dimensions(Some(100), Some(100)))
            .await
            .unwrap();
        (asset, index)
    }

    #[tokio::test]
    async fn test_generates_and_marks_file_exists() {
        let harness = Harness::new().await;
        let (asset, index) = pending(&harness).await;

        let rendition = harness.coordinator().ensure_generated(&asset, &index).await.unwrap();
        assert!(rendition.index.file_exists);
        assert!(!rendition.index.in_progress);
        assert_eq!(rendition.url, "https://cdn.test/photos/_100x100_crop_center-center_none/photo.jpg");
        assert_eq!(harness.engine.render_count(), 1);

        // a second call serves the stored file
        harness.coordinator().ensure_generated(&asset, &index).await.unwrap();
        assert_eq!(harness.engine.render_count(), 1);
    }

    #[tokio::test]
    async fn test_error_row_fails_fast() {
        let harness = Harness::new().await;
        let (asset, mut index) = pending(&harness).await;
        index.error = true;
        harness.repository.update(&index).await.unwrap();

        let result = harness.coordinator().ensure_generated(&asset, &index).await;
        assert!(matches!(result, Err(TransformError::GenerationFailed(_))));
        assert_eq!(harness.engine.render_count(), 0);
        assert_eq!(harness.wait.sleeps(), 0);
    }

    #[tokio::test]
    async fn test_render_failure_is_recorded() {
        let harness = Harness::new().await;
        harness.engine.set_fail(true);
        let (asset, index) = pending(&harness).await;

        assert!(harness.coordinator().ensure_generated(&asset, &index).await.is_err());
        let row = harness.repository.find_by_id(index.id).await.unwrap().unwrap();
        assert!(row.error);
        assert!(!row.in_progress);
        assert!(!row.file_exists);
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over() {
        let harness = Harness::new().await;
        let (asset, index) = pending(&harness).await;
        // a worker claimed the row and died
        harness.repository.try_claim(index.id).await.unwrap().unwrap();

        let rendition = harness.coordinator().ensure_generated(&asset, &index).await.unwrap();
        assert!(rendition.index.file_exists);
        assert_eq!(harness.engine.render_count(), 1);
        // 30s stale threshold with 1s polls
        assert_eq!(harness.wait.sleeps(), 31);
    }

    #[tokio::test]
    async fn test_waits_for_other_worker() {
        let harness = Harness::new().await;
        let (asset, index) = pending(&harness).await;
        let mut finished = harness.repository.try_claim(index.id).await.unwrap().unwrap();
        finished.in_progress = false;
        finished.file_exists = true;
        finished.detected_format = Some("jpg".to_string());

        // the other worker finishes during the third poll
        let repository = harness.repository.clone();
        harness.wait.on_sleep(3, move || {
            Box::pin(async move {
                repository.update(&finished).await.unwrap();
            })
        });

        let rendition = harness.coordinator().ensure_generated(&asset, &index).await.unwrap();
        assert!(rendition.index.file_exists);
        assert_eq!(harness.engine.render_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_polls_take_over() {
        let mut harness = Harness::new().await;
        harness.config.max_poll_attempts = 3;
        harness.config.stale_after_secs = 3600;
        let harness = harness.rebuild().await;
        let (asset, index) = pending(&harness).await;
        harness.repository.try_claim(index.id).await.unwrap().unwrap();

        let rendition = harness.coordinator().ensure_generated(&asset, &index).await.unwrap();
        assert!(rendition.index.file_exists);
        assert_eq!(harness.wait.sleeps(), 3);
        assert_eq!(harness.engine.render_count(), 1);
    }

    #[tokio::test]
    async fn test_deleted_row_fails() {
        let harness = Harness::new().await;
        let (asset, index) = pending(&harness).await;
        harness.repository.delete(index.id).await.unwrap();
        assert!(matches!(
            harness.coordinator().ensure_generated(&asset, &index).await,
            Err(TransformError::GenerationFailed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_render_once() {
        let harness = Arc::new(Harness::with_system_wait().await);
        harness.engine.set_delay(std::time::Duration::from_millis(50));
        let (asset, index) = pending(&harness).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let harness = harness.clone();
            let (asset, index) = (asset.clone(), index.clone());
            handles.push(tokio::spawn(async move {
                harness.coordinator().ensure_generated(&asset, &index).await
            }));
        }

        let mut urls = Vec::new();
        for handle in handles {
            urls.push(handle.await.unwrap().unwrap().url);
        }
        assert!(urls.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(harness.engine.render_count(), 1);
    }
}
