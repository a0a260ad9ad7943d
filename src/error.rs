//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore del sottosistema di trasformazione.
//!
//! ## Responsabilità:
//! - Definisce `TransformError` per categorizzare tutti gli errori possibili
//! - Distingue errori sincroni (validazione, normalizzazione) da errori di generazione
//! - Integra con `thiserror` per conversione automatica degli errori standard
//!
//! ## Categorie di errori:
//! - `DefinitionNotFound`: Handle di trasformazione inesistente
//! - `IndexResolutionFailed`: Normalizzazione dello spec fallita (es. srcset senza riferimento)
//! - `GenerationFailed`: Render o copia fallita, registrata come `error=true` sull'indice
//! - `SourceUnavailable`: Impossibile leggere/scaricare l'originale
//! - `UnsupportedFormat`: Formato richiesto senza codec disponibile
//! - `Validation`: Definizione di trasformazione non valida
//! - `Storage`: Errori del volume (scrittura, copia, lettura)
//!
//! ## Esempio:
//! ```rust,ignore
//! if !engine.supports_output(&format) {
//!     return Err(TransformError::UnsupportedFormat(format));
//! }
//! ```

/// Custom error types for transform resolution and generation
#[derive(thiserror::Error, Debug)]
pub enum TransformError {
    #[error("Invalid transform handle: {0}")]
    DefinitionNotFound(String),

    #[error("Could not resolve transform index: {0}")]
    IndexResolutionFailed(String),

    #[error("Failed to generate transform: {0}")]
    GenerationFailed(String),

    #[error("Source image unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid transform definition: {0}")]
    Validation(String),

    #[error("Operation vetoed by observer: {0}")]
    Vetoed(String),

    #[error("Project config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransformError {
    /// Errors that must be recorded on the index row as a terminal failure
    pub fn is_generation_failure(&self) -> bool {
        !matches!(
            self,
            TransformError::DefinitionNotFound(_)
                | TransformError::IndexResolutionFailed(_)
                | TransformError::Validation(_)
                | TransformError::Vetoed(_)
        )
    }
}

pub type Result<T, E = TransformError> = std::result::Result<T, E>;
