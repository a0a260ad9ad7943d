//! # Image Pipeline Module
//!
//! Questo modulo produce il file di una rendition a partire dal suo indice.
//!
//! ## Flusso di generazione:
//! 1. Ricostruisce lo spec dalla location (`parse_location` o handle nominato)
//! 2. Determina il formato di output (esplicito, passthrough web-safe, probe alpha)
//! 3. Prova a riusare una rendition identica già generata per lo stesso asset
//! 4. Lascia agli observer `on_generate` la possibilità di fornire il file
//! 5. Altrimenti renderizza (in `spawn_blocking`) e scrive sul volume
//!
//! ## Ancoraggio:
//! focal point dell'asset → posizione della trasformazione → `center-center`

pub mod source;

use crate::error::{Result, TransformError};
use crate::events::{GenerateEvent, TransformEvents};
use crate::image_processor::{Anchor, ImageEngine};
use crate::index::record::{Asset, FocalPoint, TransformIndex};
use crate::index::repository::IndexRepository;
use crate::transform::definition::{normalize_format, parse_position, Interlace, Mode};
use crate::transform::fingerprint::{named_folder_name, parse_location, unnamed_folder_name};
use crate::transform::spec::TransformSpec;
use crate::transform::store::DefinitionStore;
use crate::volume::{Volume, Volumes};
use source::{remove_quietly, SourceCache};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source extensions that are served in their own format
pub const WEB_SAFE_FORMATS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "avif", "svg"];

/// How a rendition file came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Rendered,
    Reused { donor: i64 },
    Supplied,
}

/// Everything the blocking render step needs
#[derive(Debug, Clone)]
struct RenderPlan {
    mode: Mode,
    width: Option<u32>,
    height: Option<u32>,
    quality: u8,
    anchor: Anchor,
    allow_upscale: bool,
    interlace: Option<Interlace>,
}

pub struct ImagePipeline {
    engine: Arc<dyn ImageEngine>,
    volumes: Volumes,
    repository: Arc<dyn IndexRepository>,
    definitions: DefinitionStore,
    sources: Arc<SourceCache>,
    events: TransformEvents,
    default_quality: u8,
    upscale: bool,
}

impl ImagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn ImageEngine>,
        volumes: Volumes,
        repository: Arc<dyn IndexRepository>,
        definitions: DefinitionStore,
        sources: Arc<SourceCache>,
        events: TransformEvents,
        default_quality: u8,
        upscale: bool,
    ) -> Self {
        Self {
            engine,
            volumes,
            repository,
            definitions,
            sources,
            events,
            default_quality,
            upscale,
        }
    }

    /// Produce the rendition file of `index`, recording the detected format on it
    pub async fn generate(&self, asset: &Asset, index: &mut TransformIndex) -> Result<GenerationOutcome> {
        let spec = self.spec_for_index(index)?;
        let volume = self.volumes.get(&index.volume_id)?;

        let format = self.detect_format(asset, &spec, volume.as_ref()).await?;
        index.detected_format = Some(format.clone());

        if let Some(donor) = self.find_donor(asset, index, &spec, &format).await? {
            let target = index.rendition_path();
            if !volume.file_exists(&target).await? {
                volume
                    .copy_file(&donor.rendition_path(), &target)
                    .await
                    .map_err(|e| TransformError::GenerationFailed(format!("copy from index {}: {}", donor.id, e)))?;
            }
            info!("Reused {} for {}", donor.rendition_path(), target);
            return Ok(GenerationOutcome::Reused { donor: donor.id });
        }

        let supplied = self.events.generate(&GenerateEvent {
            asset,
            index,
            spec: &spec,
            format: &format,
        });
        if let Some(path) = supplied {
            debug!("Rendition of index {} supplied by observer", index.id);
            self.store_rendition(volume.as_ref(), index, &path).await;
            return Ok(GenerationOutcome::Supplied);
        }

        let source = self.sources.local_source(asset, volume.as_ref()).await?;
        let output = self
            .sources
            .temp_dir()
            .join(format!("render-{}.{}", Uuid::new_v4(), format));
        tokio::fs::create_dir_all(self.sources.temp_dir()).await?;

        let plan = RenderPlan {
            mode: spec.mode,
            width: spec.width,
            height: spec.height,
            quality: spec.quality.unwrap_or(self.default_quality),
            anchor: choose_anchor(asset.focal_point, &spec.position),
            allow_upscale: self.upscale,
            interlace: self.engine.supports_interlace(&format).then_some(spec.interlace),
        };
        let engine = self.engine.clone();
        let (from, to) = (source.clone(), output.clone());
        let rendered = tokio::task::spawn_blocking(move || render(engine.as_ref(), &from, &to, &plan))
            .await
            .map_err(|e| TransformError::GenerationFailed(format!("render task failed: {}", e)));

        let result = match rendered {
            Ok(Ok(())) => {
                self.store_rendition(volume.as_ref(), index, &output).await;
                Ok(GenerationOutcome::Rendered)
            }
            Ok(Err(e)) | Err(e) => Err(e),
        };
        remove_quietly(&output).await;
        result
    }

    /// Rebuild the transform parameters an index was created for
    pub fn spec_for_index(&self, index: &TransformIndex) -> Result<TransformSpec> {
        let mut spec = match parse_location(&index.location) {
            Some(spec) => spec,
            None => {
                let handle = index.location.strip_prefix('_').unwrap_or(&index.location);
                self.definitions
                    .get_by_handle(handle)
                    .map(|definition| TransformSpec::from(&definition))
                    .ok_or_else(|| TransformError::DefinitionNotFound(handle.to_string()))?
            }
        };
        if let Some(ref format) = index.format {
            spec.format = Some(normalize_format(format));
        }
        Ok(spec)
    }

    /// Output format of a rendition; fails early when the engine cannot write it
    pub async fn detect_format(&self, asset: &Asset, spec: &TransformSpec, volume: &dyn Volume) -> Result<String> {
        if let Some(ref format) = spec.format {
            let format = normalize_format(format);
            if !self.engine.supports_output(&format) {
                return Err(TransformError::UnsupportedFormat(format));
            }
            return Ok(format);
        }

        let extension = asset.extension();
        if WEB_SAFE_FORMATS.contains(&extension.as_str()) && self.engine.supports_output(&extension) {
            return Ok(extension);
        }

        let format = if self.engine.supports_alpha_probe() {
            let source = self.sources.local_source(asset, volume).await?;
            let engine = self.engine.clone();
            let transparent = tokio::task::spawn_blocking(move || {
                engine.load(&source).map(|image| image.is_transparent())
            })
            .await
            .map_err(|e| TransformError::GenerationFailed(format!("alpha probe failed: {}", e)))??;
            if transparent {
                "png"
            } else {
                "jpg"
            }
        } else {
            "jpg"
        };

        if !self.engine.supports_output(format) {
            return Err(TransformError::UnsupportedFormat(format.to_string()));
        }
        Ok(format.to_string())
    }

    /// An existing rendition of the same asset with identical pixels
    async fn find_donor(
        &self,
        asset: &Asset,
        index: &TransformIndex,
        spec: &TransformSpec,
        format: &str,
    ) -> Result<Option<TransformIndex>> {
        if asset.extension() != format || asset.has_focal_point() {
            return Ok(None);
        }

        let unnamed = unnamed_folder_name(spec);
        let named = spec.handle.as_deref().map(named_folder_name);
        let named_change = spec.handle.as_deref().and_then(|handle| {
            self.definitions
                .get_by_handle(handle)
                .and_then(|definition| definition.dimension_change_time)
        });

        let candidates = self.repository.find_by_asset(asset.id).await?;
        Ok(candidates.into_iter().find(|candidate| {
            let is_named = named.as_deref() == Some(candidate.location.as_str());
            candidate.id != index.id
                && candidate.volume_id == index.volume_id
                && candidate.file_exists
                && candidate.detected_format.as_deref() == Some(format)
                && (candidate.location == unnamed || is_named)
                && candidate.is_valid_for(asset, if is_named { named_change } else { None })
        }))
    }

    async fn store_rendition(&self, volume: &dyn Volume, index: &TransformIndex, file: &Path) {
        let target = index.rendition_path();
        let mut reader = match tokio::fs::File::open(file).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Cannot read rendered file {}: {}", file.display(), e);
                return;
            }
        };
        match volume.write_file_from_stream(&target, &mut reader).await {
            Ok(bytes) => info!("Generated {} ({} bytes)", target, bytes),
            Err(e) => warn!("Failed to write {} to volume {}: {}", target, volume.id(), e),
        }
    }
}

/// Crop anchor: focal point, else the transform position, else centered
pub fn choose_anchor(focal_point: Option<FocalPoint>, position: &str) -> Anchor {
    if let Some(focal) = focal_point {
        return Anchor::Focal(focal);
    }
    parse_position(position)
        .map(|(vertical, horizontal)| Anchor::Position(vertical, horizontal))
        .unwrap_or_default()
}

/// Fill a missing target side from the source aspect ratio
pub fn resolve_dimensions(src_width: u32, src_height: u32, width: Option<u32>, height: Option<u32>) -> (u32, u32) {
    let (sw, sh) = (src_width.max(1) as f64, src_height.max(1) as f64);
    match (width, height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, ((w as f64 * sh / sw).round() as u32).max(1)),
        (None, Some(h)) => (((h as f64 * sw / sh).round() as u32).max(1), h),
        (None, None) => (src_width, src_height),
    }
}

fn render(engine: &dyn ImageEngine, source: &Path, output: &Path, plan: &RenderPlan) -> Result<()> {
    let mut image = engine.load(source)?;
    let (width, height) = resolve_dimensions(image.width(), image.height(), plan.width, plan.height);

    image.set_quality(plan.quality);
    match plan.mode {
        Mode::Fit => image.scale_to_fit(plan.width, plan.height)?,
        Mode::Stretch => image.resize(width, height)?,
        Mode::Crop => image.scale_and_crop(width, height, plan.allow_upscale, plan.anchor)?,
    }
    if let Some(interlace) = plan.interlace {
        image.set_interlace(interlace);
    }
    image.save_as(output)
}
