//! # Index Records Module
//!
//! Questo modulo definisce i record che tracciano lo stato di generazione delle rendition.
//!
//! ## Strutture dati:
//! - `Asset`: L'asset sorgente (volume, cartella, filename, data di modifica, focal point)
//! - `TransformIndex`: Una riga per combinazione (asset, location, format)
//!
//! ## Validità di un indice:
//! - `date_indexed >= asset.date_modified`
//! - Per trasformazioni nominate anche `date_indexed >= dimension_change_time`
//! - Un indice non valido va cancellato insieme al file generato
//!
//! ## Ciclo di vita:
//! - Creato con `file_exists=false, in_progress=false`
//! - `in_progress=true` durante la generazione
//! - Termina in `file_exists=true` (successo) o `error=true` (fallimento)
//!
//! ## Esempio struttura indice:
//! ```json
//! {
//!   "id": 12,
//!   "asset_id": 4,
//!   "volume_id": "uploads",
//!   "folder_path": "blog/2024",
//!   "location": "_thumb",
//!   "format": null,
//!   "detected_format": "jpg",
//!   "filename": "cover.jpg",
//!   "file_exists": true,
//!   "in_progress": false,
//!   "error": false
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Crop anchor set on the asset, both coordinates in 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocalPoint {
    pub x: f64,
    pub y: f64,
}

impl FocalPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }
}

/// Source asset as seen by the transform subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: i64,
    pub volume_id: String,
    /// Folder inside the volume, without leading or trailing slash
    pub folder_path: String,
    pub filename: String,
    pub date_modified: DateTime<Utc>,
    pub focal_point: Option<FocalPoint>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Asset {
    pub fn new(id: i64, volume_id: &str, folder_path: &str, filename: &str, date_modified: DateTime<Utc>) -> Self {
        Self {
            id,
            volume_id: volume_id.to_string(),
            folder_path: folder_path.trim_matches('/').to_string(),
            filename: filename.to_string(),
            date_modified,
            focal_point: None,
            width: None,
            height: None,
        }
    }

    /// Path of the source file inside its volume
    pub fn path(&self) -> String {
        join_path(&self.folder_path, &self.filename)
    }

    /// Lowercased extension with `jpeg` folded into `jpg`
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.filename)
            .extension()
            .map(|ext| crate::transform::definition::normalize_format(&ext.to_string_lossy()))
            .unwrap_or_default()
    }

    pub fn has_focal_point(&self) -> bool {
        self.focal_point.is_some()
    }
}

/// Join volume path segments with `/`, skipping empty ones
pub fn join_path(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        name.trim_start_matches('/').to_string()
    } else {
        format!("{}/{}", folder, name.trim_start_matches('/'))
    }
}

/// Generation state of one (asset, location, format) rendition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformIndex {
    pub id: i64,
    pub asset_id: i64,
    pub volume_id: String,
    pub folder_path: String,
    pub format: Option<String>,
    pub detected_format: Option<String>,
    pub location: String,
    pub filename: Option<String>,
    pub file_exists: bool,
    pub in_progress: bool,
    pub error: bool,
    pub date_indexed: DateTime<Utc>,
    pub date_updated: DateTime<Utc>,
    pub date_created: DateTime<Utc>,
}

impl TransformIndex {
    /// Fresh, not yet persisted index for an asset (id 0 until inserted)
    pub fn new(asset: &Asset, location: &str, format: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            asset_id: asset.id,
            volume_id: asset.volume_id.clone(),
            folder_path: asset.folder_path.clone(),
            format: format.map(str::to_string),
            detected_format: None,
            location: location.to_string(),
            filename: Some(asset.filename.clone()),
            file_exists: false,
            in_progress: false,
            error: false,
            date_indexed: now,
            date_updated: now,
            date_created: now,
        }
    }

    /// Check the index against the asset and, for named transforms, the definition clock
    pub fn is_valid_for(&self, asset: &Asset, dimension_change_time: Option<DateTime<Utc>>) -> bool {
        if self.date_indexed < asset.date_modified {
            return false;
        }
        match dimension_change_time {
            Some(changed) => self.date_indexed >= changed,
            None => true,
        }
    }

    /// Whether the row matches a requested (location, format) pair
    pub fn matches(&self, location: &str, format: Option<&str>) -> bool {
        self.location == location && self.format.as_deref() == format
    }

    /// Output format of the rendition, once known
    pub fn output_format(&self) -> Option<&str> {
        self.format.as_deref().or(self.detected_format.as_deref())
    }

    /// Rendition filename with the extension swapped for the output format
    pub fn rendition_filename(&self) -> String {
        let filename = self.filename.clone().unwrap_or_default();
        match self.output_format() {
            Some(format) => {
                let stem = std::path::Path::new(&filename)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or(filename);
                format!("{}.{}", stem, format)
            }
            None => filename,
        }
    }

    /// Path of the generated file inside the volume
    pub fn rendition_path(&self) -> String {
        join_path(&join_path(&self.folder_path, &self.location), &self.rendition_filename())
    }
}
