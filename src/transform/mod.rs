//! # Transform Module
//!
//! Definizioni nominate, normalizzazione degli input e naming delle cartelle.
//!
//! ## Componenti:
//! - `definition`: `TransformDefinition`, modalità, posizioni, validazione
//! - `spec`: `TransformInput` → `TransformSpec`, estensione e dimensioni relative
//! - `fingerprint`: nome cartella e chiave di cache di uno spec
//! - `store`: `DefinitionStore` sincronizzato con il project config

pub mod definition;
pub mod fingerprint;
pub mod spec;
pub mod store;

pub use definition::{Interlace, Mode, TransformDefinition};
pub use spec::{TransformInput, TransformSpec};
pub use store::DefinitionStore;
