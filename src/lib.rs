//! # Asset Transforms Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare dell'applicazione
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori
//!
//! ## Architettura dei moduli:
//! - `config`: Gestione configurazione e validazione parametri
//! - `error`: Tipi di errore della libreria
//! - `transform`: Definizioni nominate, normalizzazione, naming delle cartelle
//! - `project_config`: Config di progetto propagato agli observer
//! - `index`: Record degli indici, repository e cache per-richiesta
//! - `volume`: Astrazione dello storage (locale o remoto)
//! - `image_processor`: Motore raster (scala, crop, encoding)
//! - `pipeline`: Generazione del file di una rendition
//! - `generator`: Coordinamento tra worker concorrenti
//! - `cleanup`: Rimozione di indici e file
//! - `service`: Facade che unisce tutti i componenti
//! - `batch`, `file_manager`, `progress`: Supporto alla CLI
//!
//! ## Utilizzo:
//! ```rust,ignore
//! use asset_transforms::{Config, TransformInput, TransformService};
//!
//! let service = TransformService::builder(Config::default())
//!     .volume(volume)
//!     .build()
//!     .await?;
//! let url = service.url_for(&asset, &TransformInput::from("thumb")).await?;
//! ```

pub mod batch;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod file_manager;
pub mod generator;
pub mod image_processor;
pub mod index;
pub mod pipeline;
pub mod progress;
pub mod project_config;
pub mod service;
pub mod transform;
pub mod volume;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::TransformError;
pub use generator::Rendition;
pub use index::{Asset, FocalPoint, InMemoryIndexRepository, IndexRepository, TransformIndex};
pub use service::{TransformService, TransformServiceBuilder};
pub use transform::{DefinitionStore, Mode, TransformDefinition, TransformInput, TransformSpec};
pub use volume::{LocalVolume, Volume};
