//! # File Management Module
//!
//! Questo modulo gestisce la discovery degli asset immagine in una directory.
//!
//! ## Responsabilità:
//! - Discovery ricorsiva di immagini sorgente
//! - Esclusione delle cartelle di rendition (`_<handle>`, `_<w>x<h>_...`)
//! - Conversione di un file in `Asset` (id stabile, cartella relativa, data di modifica)
//!
//! ## Formati sorgente:
//! JPG, JPEG, PNG, GIF, WebP, TIFF, BMP
//!
//! ## Esempio:
//! ```rust,ignore
//! let files = FileManager::find_image_files(&root)?;
//! for file in files {
//!     let asset = FileManager::asset_for(&root, &file, "local").await?;
//! }
//! ```

use crate::index::record::Asset;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

/// Manages asset discovery
pub struct FileManager;

impl FileManager {
    /// Find all source images below `root`, skipping rendition folders
    pub fn find_image_files(root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('_'))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if Self::is_image(path) {
                files.push(path.to_path_buf());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Check if a file is a supported source image
    pub fn is_image(path: &Path) -> bool {
        if let Some(ext) = path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            matches!(
                ext_lower.as_str(),
                "jpg" | "jpeg" | "png" | "gif" | "webp" | "tif" | "tiff" | "bmp"
            )
        } else {
            false
        }
    }

    /// Stable positive id derived from the path relative to the volume root
    pub fn asset_id(relative_path: &str) -> i64 {
        let digest = Sha256::digest(relative_path.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(bytes) >> 1) as i64
    }

    /// Describe `path` as an asset of the volume rooted at `root`
    pub async fn asset_for(root: &Path, path: &Path, volume_id: &str) -> Result<Asset> {
        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
        let filename = relative
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let folder = relative
            .parent()
            .map(|parent| {
                parent
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();

        let metadata = fs::metadata(path).await?;
        let modified: DateTime<Utc> = metadata.modified()?.into();

        let id = Self::asset_id(&crate::index::record::join_path(&folder, &filename));
        Ok(Asset::new(id, volume_id, &folder, &filename, modified))
    }
}
