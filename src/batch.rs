//! # Batch Generation Module
//!
//! Genera le rendition di molti asset per una lista di trasformazioni, con
//! concorrenza limitata.
//!
//! ## Flusso:
//! 1. `eager_load` di tutti gli asset × trasformazioni (una query batch)
//! 2. Le rendition già presenti vengono solo contate
//! 3. Le altre vengono generate in task separati, limitati da un `Semaphore`
//! 4. Fine richiesta: mappa eager svuotata e temporanei rimossi
//!
//! ## Sintassi delle trasformazioni da CLI:
//! - `thumb`: handle di una trasformazione nominata
//! - `300x200`, `300xAUTO:fit`, `AUTOx200:crop:top-left`: trasformazione ad-hoc

use crate::error::{Result, TransformError};
use crate::index::record::Asset;
use crate::progress::{GenerationStats, ProgressManager};
use crate::service::TransformService;
use crate::transform::spec::TransformInput;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error};

/// Parse a command line transform argument
pub fn parse_transform_arg(arg: &str) -> Result<TransformInput> {
    let mut parts = arg.split(':');
    let head = parts.next().unwrap_or_default();

    let Some((width, height)) = head.split_once('x') else {
        return Ok(TransformInput::ByHandle(arg.to_string()));
    };
    let dimension = |value: &str| -> Result<Option<Value>> {
        match value {
            "AUTO" | "" => Ok(None),
            v => v
                .parse::<u32>()
                .map(|d| Some(json!(d)))
                .map_err(|_| TransformError::IndexResolutionFailed(format!("invalid transform '{}'", arg))),
        }
    };
    // handles such as "box" contain an 'x' too
    let (Ok(width), Ok(height)) = (dimension(width), dimension(height)) else {
        return Ok(TransformInput::ByHandle(arg.to_string()));
    };
    if width.is_none() && height.is_none() {
        return Err(TransformError::IndexResolutionFailed(format!(
            "transform '{}' needs a width or a height",
            arg
        )));
    }

    let mut properties = Map::new();
    if let Some(width) = width {
        properties.insert("width".to_string(), width);
    }
    if let Some(height) = height {
        properties.insert("height".to_string(), height);
    }
    if let Some(mode) = parts.next() {
        properties.insert("mode".to_string(), json!(mode));
    }
    if let Some(position) = parts.next() {
        properties.insert("position".to_string(), json!(position));
    }
    Ok(TransformInput::ByProperties(properties))
}

/// Force an output format and/or quality on a transform input
pub fn with_overrides(input: TransformInput, format: Option<&str>, quality: Option<u8>) -> TransformInput {
    let mut overrides = Map::new();
    if let Some(format) = format {
        overrides.insert("format".to_string(), json!(format));
    }
    if let Some(quality) = quality {
        overrides.insert("quality".to_string(), json!(quality));
    }
    if overrides.is_empty() {
        return input;
    }

    match input {
        TransformInput::ByProperties(mut properties) => {
            properties.extend(overrides);
            TransformInput::ByProperties(properties)
        }
        other => TransformInput::Extend {
            base: Box::new(other),
            overrides,
        },
    }
}

/// Generates every rendition of a set of assets
pub struct BatchGenerator {
    service: Arc<TransformService>,
    workers: usize,
}

impl BatchGenerator {
    pub fn new(service: Arc<TransformService>, workers: usize) -> Self {
        Self {
            service,
            workers: workers.max(1),
        }
    }

    pub async fn run(
        &self,
        assets: &[Asset],
        inputs: &[TransformInput],
        progress: &ProgressManager,
    ) -> Result<GenerationStats> {
        let indexes = self.service.eager_load(assets, inputs).await?;
        progress.set_length(indexes.len() as u64);
        let by_id: HashMap<i64, &Asset> = assets.iter().map(|asset| (asset.id, asset)).collect();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut stats = GenerationStats::new();
        let mut tasks = Vec::new();

        for index in indexes {
            if index.file_exists {
                stats.add_existing();
                progress.update(&index.rendition_path());
                continue;
            }
            let Some(asset) = by_id.get(&index.asset_id).map(|asset| (*asset).clone()) else {
                continue;
            };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| TransformError::GenerationFailed(e.to_string()))?;
            let service = self.service.clone();
            let progress = progress.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let result = service.coordinator().ensure_generated(&asset, &index).await;
                progress.update(&index.rendition_path());
                (index, result)
            }));
        }

        for task in tasks {
            match task.await {
                Ok((_, Ok(rendition))) => {
                    debug!("Generated {}", rendition.url);
                    stats.add_generated();
                }
                Ok((index, Err(e))) => {
                    error!("Failed to generate {}: {}", index.rendition_path(), e);
                    stats.add_error();
                }
                Err(e) => {
                    error!("Generation task panicked: {}", e);
                    stats.add_error();
                }
            }
        }

        self.service.end_request().await;
        Ok(stats)
    }
}
