//! # Configuration Management Module
//!
//! Questo modulo gestisce la configurazione del servizio di trasformazione.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con tutti i parametri di generazione
//! - Fornisce validazione dei parametri di input
//! - Supporta caricamento/salvataggio configurazione da/verso file JSON
//! - Fornisce valori di default sensati per tutti i parametri
//!
//! ## Parametri di configurazione:
//! - `default_image_quality`: Qualità usata quando la trasformazione non la specifica (1-100, default: 82)
//! - `upscale_images`: Permette di ingrandire immagini più piccole del target nei crop (default: true)
//! - `generate_transforms_before_page_load`: Genera subito o restituisce un URL differito (default: true)
//! - `deferred_url_prefix`: Prefisso degli URL differiti (default: "/actions/assets/generate-transform")
//! - `max_cached_cloud_image_size`: Lato massimo della copia locale di sorgenti remote (0 = copia intera)
//! - `poll_interval_ms`: Intervallo di polling per indici in lavorazione (default: 1000)
//! - `max_poll_attempts`: Numero massimo di iterazioni di polling (default: 100)
//! - `stale_after_secs`: Dopo quanti secondi un worker è considerato morto (default: 30)
//! - `cache_dir`: Directory per sorgenti remote e file temporanei (default: cache di sistema)
//!
//! ## Esempio:
//! ```rust,ignore
//! let config = Config {
//!     default_image_quality: 90,
//!     upscale_images: false,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for transform generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Quality used when a transform does not declare one (1-100)
    pub default_image_quality: u8,
    /// Allow crop transforms to enlarge sources smaller than the target
    pub upscale_images: bool,
    /// Generate renditions while building the URL instead of deferring
    pub generate_transforms_before_page_load: bool,
    /// Prefix for deferred generation URLs
    pub deferred_url_prefix: String,
    /// Longest side of the local copy kept for remote sources (0 keeps the full file)
    pub max_cached_cloud_image_size: u32,
    /// Poll interval while another worker generates the same index
    pub poll_interval_ms: u64,
    /// Maximum number of poll iterations
    pub max_poll_attempts: u32,
    /// Seconds after which an in-progress claim is considered abandoned
    pub stale_after_secs: u64,
    /// Directory for cached sources and temporary renders (None = system cache dir)
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_image_quality: 82,
            upscale_images: true,
            generate_transforms_before_page_load: true,
            deferred_url_prefix: "/actions/assets/generate-transform".to_string(),
            max_cached_cloud_image_size: 2000,
            poll_interval_ms: 1000,
            max_poll_attempts: 100,
            stale_after_secs: 30,
            cache_dir: None,
        }
    }
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.default_image_quality == 0 || self.default_image_quality > 100 {
            return Err(anyhow::anyhow!("Default image quality must be between 1 and 100"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Poll interval must be greater than 0"));
        }

        if self.max_poll_attempts == 0 {
            return Err(anyhow::anyhow!("Max poll attempts must be greater than 0"));
        }

        if self.stale_after_secs == 0 {
            return Err(anyhow::anyhow!("Stale timeout must be greater than 0"));
        }

        if let Some(ref cache_dir) = self.cache_dir {
            if cache_dir.exists() && !cache_dir.is_dir() {
                return Err(anyhow::anyhow!("Cache path is not a directory: {}", cache_dir.display()));
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    /// Resolve the cache directory, falling back to the user cache dir
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("asset-transforms")
        })
    }

    /// Load configuration from file
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert_ok!(config.validate());

        config.default_image_quality = 0;
        assert_err!(config.validate());

        config.default_image_quality = 82;
        config.max_poll_attempts = 0;
        assert_err!(config.validate());

        config.max_poll_attempts = 100;
        config.stale_after_secs = 0;
        assert_err!(config.validate());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.default_image_quality, 82);
        assert!(config.upscale_images);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.max_poll_attempts, 100);
        assert_eq!(config.stale_after(), chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        let original_config = Config {
            default_image_quality: 70,
            upscale_images: false,
            max_cached_cloud_image_size: 0,
            cache_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        original_config.save_to_file(&config_path).await.unwrap();
        let loaded_config = Config::from_file(&config_path).await.unwrap();

        assert_eq!(loaded_config.default_image_quality, 70);
        assert!(!loaded_config.upscale_images);
        assert_eq!(loaded_config.max_cached_cloud_image_size, 0);
        assert_eq!(loaded_config.resolved_cache_dir(), temp_dir.path());
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::from_file(&temp_dir.path().join("nope.json")).await.unwrap();
        assert_eq!(config.default_image_quality, 82);
    }
}
