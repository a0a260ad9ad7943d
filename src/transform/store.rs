//! # Transform Definition Store
//!
//! Questo modulo gestisce le trasformazioni nominate.
//!
//! ## Responsabilità:
//! - Snapshot delle definizioni ordinato per nome, costruito pigramente e
//!   invalidato dopo ogni modifica (`invalidate()` / `reload()`)
//! - `save()` / `delete()` passano sempre dal `ProjectConfig`: lo stato locale
//!   viene aggiornato solo dal listener `DefinitionSync`
//! - Il listener applica le modifiche in una transazione con rollback, aggiorna
//!   `dimension_change_time` quando cambiano i parametri che influenzano i pixel
//!   e cancella gli indici della cartella `_<handle>`
//!
//! ## Flusso di salvataggio:
//! ```text
//! save() → validate → before_save (veto) → ProjectConfig::set
//!        → DefinitionSync::handle_change → upsert + invalidazione indici
//!        → after_save
//! ```

use crate::cleanup::Cleanup;
use crate::clock::Clock;
use crate::error::{Result, TransformError};
use crate::events::{DefinitionEvent, TransformEvents};
use crate::project_config::{ConfigEvent, ConfigListener, ProjectConfig};
use crate::transform::definition::{DefinitionConfig, TransformDefinition};
use crate::transform::fingerprint::named_folder_name;
use crate::transform::spec::DefinitionLookup;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Project config prefix under which definitions are stored, keyed by uid
pub const PREFIX: &str = "imageTransforms";

#[derive(Debug, Clone, Default)]
struct DefinitionTable {
    next_id: i64,
    rows: BTreeMap<String, TransformDefinition>,
}

struct StoreState {
    table: Mutex<DefinitionTable>,
    snapshot: RwLock<Option<Arc<Vec<TransformDefinition>>>>,
    clock: Arc<dyn Clock>,
    cleanup: Arc<Cleanup>,
}

impl StoreState {
    fn table(&self) -> MutexGuard<'_, DefinitionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalidate(&self) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Built and published under the table lock; mutations invalidate under it too
    fn snapshot(&self) -> Arc<Vec<TransformDefinition>> {
        if let Some(ref snapshot) = *self.snapshot.read().unwrap_or_else(PoisonError::into_inner) {
            return snapshot.clone();
        }

        let table = self.table();
        let mut published = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(ref snapshot) = *published {
            return snapshot.clone();
        }
        let mut definitions: Vec<TransformDefinition> = table.rows.values().cloned().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.handle.cmp(&b.handle)));
        let snapshot = Arc::new(definitions);
        *published = Some(snapshot.clone());
        snapshot
    }

    /// Upsert one definition; returns the folders whose indexes became stale
    fn apply_upsert(&self, uid: &str, config: DefinitionConfig, replayed: bool) -> Result<Vec<String>> {
        let mut table = self.table();
        let backup = table.clone();

        let result = (|| {
            if let Some((_, other)) = table.rows.iter().find(|(key, row)| *key != uid && row.handle == config.handle) {
                return Err(TransformError::Validation(format!(
                    "handle '{}' is already used by '{}'",
                    config.handle, other.name
                )));
            }

            let existing = table.rows.get(uid).cloned();
            let id = match existing.as_ref().and_then(|row| row.id) {
                Some(id) => id,
                None => {
                    table.next_id += 1;
                    table.next_id
                }
            };

            let mut definition = config.into_definition(uid, Some(id));
            definition.dimension_change_time = existing.as_ref().and_then(|row| row.dimension_change_time);

            let changed = match existing {
                Some(ref previous) => previous.dimensions_differ(&definition),
                // replaying an unchanged value on a fresh table is not a change
                None => !replayed,
            };

            let mut stale = Vec::new();
            if changed {
                definition.dimension_change_time = Some(self.clock.now());
                stale.push(named_folder_name(&definition.handle));
            }
            if let Some(ref previous) = existing {
                if previous.handle != definition.handle {
                    stale.push(named_folder_name(&previous.handle));
                }
            }

            table.rows.insert(uid.to_string(), definition);
            Ok(stale)
        })();

        if result.is_err() {
            *table = backup;
        }
        self.invalidate();
        result
    }

    fn apply_remove(&self, uid: &str) -> Option<TransformDefinition> {
        let mut table = self.table();
        let removed = table.rows.remove(uid);
        self.invalidate();
        removed
    }

    async fn invalidate_folders(&self, folders: &[String]) {
        for folder in folders {
            if let Err(e) = self.cleanup.delete_transform_folder(folder).await {
                warn!("Failed to invalidate transform indexes in {}: {}", folder, e);
            }
        }
    }
}

/// Applies `imageTransforms.<uid>` changes to the local definition table
struct DefinitionSync {
    state: Arc<StoreState>,
}

#[async_trait]
impl ConfigListener for DefinitionSync {
    async fn handle_change(&self, event: &ConfigEvent) -> Result<()> {
        let uid = event.token.as_str();

        let Some(ref value) = event.new_value else {
            if let Some(removed) = self.state.apply_remove(uid) {
                info!("Removed transform \"{}\"", removed.handle);
                self.state
                    .invalidate_folders(&[named_folder_name(&removed.handle)])
                    .await;
            }
            return Ok(());
        };

        let config: DefinitionConfig = serde_json::from_value(value.clone())?;
        let handle = config.handle.clone();
        let replayed = event.old_value.as_ref() == Some(value);
        let stale = self.state.apply_upsert(uid, config, replayed)?;

        if !stale.is_empty() {
            debug!("Transform \"{}\" changed, invalidating {:?}", handle, stale);
            self.state.invalidate_folders(&stale).await;
        }
        Ok(())
    }
}

/// Named transform definitions, synchronized through the project config
#[derive(Clone)]
pub struct DefinitionStore {
    state: Arc<StoreState>,
    project_config: Arc<ProjectConfig>,
    events: TransformEvents,
}

impl DefinitionStore {
    /// Create the store and subscribe it to definition changes
    pub fn new(
        project_config: Arc<ProjectConfig>,
        events: TransformEvents,
        clock: Arc<dyn Clock>,
        cleanup: Arc<Cleanup>,
    ) -> Self {
        let state = Arc::new(StoreState {
            table: Mutex::new(DefinitionTable::default()),
            snapshot: RwLock::new(None),
            clock,
            cleanup,
        });
        project_config.listen(PREFIX, Arc::new(DefinitionSync { state: state.clone() }));

        Self {
            state,
            project_config,
            events,
        }
    }

    /// Rebuild the local table from the values already in the project config
    pub async fn load(&self) -> Result<usize> {
        let count = self.project_config.replay(PREFIX).await?;
        debug!("Loaded {} transform definitions", count);
        Ok(count)
    }

    /// All definitions ordered by name
    pub fn list(&self) -> Vec<TransformDefinition> {
        self.state.snapshot().as_ref().clone()
    }

    pub fn get_by_handle(&self, handle: &str) -> Option<TransformDefinition> {
        self.state.snapshot().iter().find(|d| d.handle == handle).cloned()
    }

    pub fn get_by_id(&self, id: i64) -> Option<TransformDefinition> {
        self.state.snapshot().iter().find(|d| d.id == Some(id)).cloned()
    }

    pub fn get_by_uid(&self, uid: &str) -> Option<TransformDefinition> {
        self.state.snapshot().iter().find(|d| d.uid.as_deref() == Some(uid)).cloned()
    }

    /// Drop the snapshot; the next read rebuilds it
    pub fn invalidate(&self) {
        self.state.invalidate();
    }

    pub fn reload(&self) -> usize {
        self.state.invalidate();
        self.state.snapshot().len()
    }

    /// Validate and publish a definition; returns the stored row
    pub async fn save(&self, definition: &TransformDefinition) -> Result<TransformDefinition> {
        definition.validate()?;

        let is_new = definition
            .uid
            .as_deref()
            .map_or(true, |uid| self.get_by_uid(uid).is_none());
        let mut definition = definition.clone();
        let uid = definition
            .uid
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        self.events.before_save(&DefinitionEvent {
            definition: &definition,
            is_new,
        })?;

        let value = serde_json::to_value(DefinitionConfig::from(&definition))?;
        self.project_config
            .set(
                &format!("{}.{}", PREFIX, uid),
                value,
                &format!("Saving transform \"{}\"", definition.handle),
            )
            .await?;

        let saved = self.get_by_uid(&uid).ok_or_else(|| {
            TransformError::Config(format!("transform \"{}\" was not applied", definition.handle))
        })?;
        self.events.after_save(&DefinitionEvent {
            definition: &saved,
            is_new,
        });
        Ok(saved)
    }

    pub async fn delete(&self, definition: &TransformDefinition) -> Result<()> {
        let existing = definition
            .uid
            .as_deref()
            .and_then(|uid| self.get_by_uid(uid))
            .ok_or_else(|| TransformError::DefinitionNotFound(definition.handle.clone()))?;
        let uid = existing.uid.clone().unwrap_or_default();

        self.events.before_delete(&DefinitionEvent {
            definition: &existing,
            is_new: false,
        })?;

        self.project_config
            .remove(
                &format!("{}.{}", PREFIX, uid),
                &format!("Delete transform \"{}\"", existing.handle),
            )
            .await?;

        self.events.after_delete(&DefinitionEvent {
            definition: &existing,
            is_new: false,
        });
        Ok(())
    }
}

impl DefinitionLookup for DefinitionStore {
    fn definition_by_handle(&self, handle: &str) -> Option<TransformDefinition> {
        self.get_by_handle(handle)
    }
}
