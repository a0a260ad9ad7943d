//! # Index Module
//!
//! Stato persistito delle rendition: record, repository e cache per richiesta.

pub mod cache;
pub mod record;
pub mod repository;

pub use cache::IndexCache;
pub use record::{Asset, FocalPoint, TransformIndex};
pub use repository::{IndexRepository, InMemoryIndexRepository};
