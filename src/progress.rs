//! # Progress Tracking and Statistics Module
//!
//! Questo modulo gestisce il progress tracking e le statistiche di generazione batch.
//!
//! ## Responsabilità:
//! - Progress bar visual con `indicatif` per feedback real-time
//! - Tracking delle rendition generate, già presenti e fallite
//! - Report finale con statistiche aggregate
//!
//! ## Componenti principali:
//! - `ProgressManager`: Gestisce la progress bar principale
//! - `GenerationStats`: Traccia statistiche cumulative
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:00:12] [=================>----------------------] 48/110 (43%) _thumb/photo.jpg
//! ```
//!
//! ## Esempio:
//! ```rust,ignore
//! let progress = ProgressManager::new(0);
//! progress.set_length(indexes.len() as u64);
//! let mut stats = GenerationStats::new();
//!
//! stats.add_generated();
//! progress.update("_thumb/photo.jpg");
//!
//! progress.finish(&stats.format_summary());
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Manages progress reporting for batch generation
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    pub fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);

        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Hidden bar, for quiet runs and tests
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Update progress with a message
    pub fn update(&self, message: &str) {
        self.bar.inc(1);
        self.bar.set_message(message.to_string());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Resize the bar once the real amount of work is known
    pub fn set_length(&self, total: u64) {
        self.bar.set_length(total);
    }

    pub fn length(&self) -> u64 {
        self.bar.length().unwrap_or(0)
    }

    /// Finish with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

/// Statistics of one batch run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GenerationStats {
    pub renditions: usize,
    pub generated: usize,
    pub existing: usize,
    pub errors: usize,
}

impl GenerationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_generated(&mut self) {
        self.renditions += 1;
        self.generated += 1;
    }

    pub fn add_existing(&mut self) {
        self.renditions += 1;
        self.existing += 1;
    }

    pub fn add_error(&mut self) {
        self.renditions += 1;
        self.errors += 1;
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Renditions: {} | Generated: {} | Already present: {} | Errors: {}",
            self.renditions, self.generated, self.existing, self.errors
        )
    }
}
