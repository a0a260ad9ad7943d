//! # Transform Index Cache
//!
//! Risolve la coppia (asset, spec) nel suo indice, creando la riga se serve.
//!
//! ## Responsabilità:
//! - `resolve_or_create()`: mappa eager → query → validazione → creazione
//! - `eager_load()`: pre-carica in batch gli indici di molti asset per molte
//!   trasformazioni, con una sola query e una sola cancellazione batch
//! - Mappa eager per richiesta, chiave `"<asset_id>:<fingerprint>"`
//!
//! ## Validità di un indice:
//! - `date_indexed >= asset.date_modified`
//! - per trasformazioni nominate anche `date_indexed >= dimension_change_time`
//!
//! Un indice non valido viene cancellato insieme al file generato.

use crate::cleanup::Cleanup;
use crate::clock::Clock;
use crate::error::Result;
use crate::index::record::{Asset, TransformIndex};
use crate::index::repository::IndexRepository;
use crate::transform::fingerprint::{fingerprint, folder_name};
use crate::transform::spec::{normalize_list, TransformInput, TransformSpec};
use crate::transform::store::DefinitionStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub struct IndexCache {
    repository: Arc<dyn IndexRepository>,
    definitions: DefinitionStore,
    cleanup: Arc<Cleanup>,
    clock: Arc<dyn Clock>,
    eager: Mutex<HashMap<String, TransformIndex>>,
}

/// Eager map key of an asset and a transform fingerprint
pub fn eager_key(asset_id: i64, fingerprint: &str) -> String {
    format!("{}:{}", asset_id, fingerprint)
}

fn index_fingerprint(index: &TransformIndex) -> String {
    match index.format {
        Some(ref format) => format!("{}:{}", index.location, format),
        None => index.location.clone(),
    }
}

impl IndexCache {
    pub fn new(
        repository: Arc<dyn IndexRepository>,
        definitions: DefinitionStore,
        cleanup: Arc<Cleanup>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            definitions,
            cleanup,
            clock,
            eager: Mutex::new(HashMap::new()),
        }
    }

    /// Index of `asset` for `spec`, creating a fresh row when none is valid
    pub async fn resolve_or_create(&self, asset: &Asset, spec: &TransformSpec) -> Result<TransformIndex> {
        if let Some(index) = self.eager().get(&eager_key(asset.id, &fingerprint(spec))) {
            return Ok(index.clone());
        }

        let location = folder_name(spec);
        let format = spec.format.as_deref();

        if let Some(existing) = self
            .repository
            .find(&asset.volume_id, asset.id, &location, format)
            .await?
        {
            if existing.is_valid_for(asset, self.dimension_change_time(spec)) {
                return Ok(existing);
            }
            debug!("Index {} of {} is stale, regenerating", existing.id, asset.path());
            self.cleanup.delete_index(&existing).await?;
        }

        self.repository
            .insert(TransformIndex::new(asset, &location, format, self.clock.now()))
            .await
    }

    /// Resolve every asset × transform pair in batch and keep them for this request
    pub async fn eager_load(&self, assets: &[Asset], inputs: &[TransformInput]) -> Result<Vec<TransformIndex>> {
        if assets.is_empty() || inputs.is_empty() {
            return Ok(Vec::new());
        }

        let mut specs: Vec<TransformSpec> = Vec::new();
        for spec in normalize_list(inputs, &self.definitions)? {
            if !specs.iter().any(|s| fingerprint(s) == fingerprint(&spec)) {
                specs.push(spec);
            }
        }

        let asset_ids: Vec<i64> = assets.iter().map(|asset| asset.id).collect();
        let mut locations: Vec<String> = specs.iter().map(folder_name).collect();
        locations.sort();
        locations.dedup();
        let rows = self.repository.find_for_assets(&asset_ids, &locations).await?;

        let mut resolved: Vec<Option<TransformIndex>> = Vec::new();
        let mut stale: Vec<TransformIndex> = Vec::new();
        let mut missing: Vec<(usize, TransformIndex)> = Vec::new();
        let now = self.clock.now();

        for asset in assets {
            for spec in &specs {
                let location = folder_name(spec);
                let format = spec.format.as_deref();
                let dimension_change_time = self.dimension_change_time(spec);

                let mut found = None;
                for row in rows.iter().filter(|row| {
                    row.asset_id == asset.id && row.volume_id == asset.volume_id && row.matches(&location, format)
                }) {
                    if found.is_none() && row.is_valid_for(asset, dimension_change_time) {
                        found = Some(row.clone());
                    } else if !stale.iter().any(|s: &TransformIndex| s.id == row.id) {
                        stale.push(row.clone());
                    }
                }

                if found.is_none() {
                    missing.push((resolved.len(), TransformIndex::new(asset, &location, format, now)));
                }
                resolved.push(found);
            }
        }

        if !stale.is_empty() {
            debug!("Eager load dropping {} stale indexes", stale.len());
            self.cleanup.delete_indexes(&stale).await?;
        }

        for (slot, index) in missing {
            resolved[slot] = Some(self.repository.insert(index).await?);
        }

        let indexes: Vec<TransformIndex> = resolved.into_iter().flatten().collect();
        let mut eager = self.eager();
        for index in &indexes {
            eager.insert(eager_key(index.asset_id, &index_fingerprint(index)), index.clone());
        }
        Ok(indexes)
    }

    /// Refresh the eager entry of an index after it changed
    pub fn remember(&self, index: &TransformIndex) {
        let key = eager_key(index.asset_id, &index_fingerprint(index));
        if let Some(entry) = self.eager().get_mut(&key) {
            *entry = index.clone();
        }
    }

    pub fn forget_asset(&self, asset_id: i64) {
        let prefix = format!("{}:", asset_id);
        self.eager().retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn clear_eager_loaded(&self) {
        self.eager().clear();
    }

    pub fn eager_loaded_count(&self) -> usize {
        self.eager().len()
    }

    fn dimension_change_time(&self, spec: &TransformSpec) -> Option<DateTime<Utc>> {
        let handle = spec.handle.as_deref()?;
        self.definitions
            .get_by_handle(handle)
            .and_then(|definition| definition.dimension_change_time)
            .or(spec.dimension_change_time)
    }

    fn eager(&self) -> MutexGuard<'_, HashMap<String, TransformIndex>> {
        self.eager.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
