//! # Project Config Module
//!
//! Store chiave/valore con notifiche di modifica, usato per propagare le
//! definizioni di trasformazione tra ambienti.
//!
//! ## Responsabilità:
//! - `set(path, value, description)` / `remove(path, description)`
//! - Notifica ai `ConfigListener` registrati per prefisso, con token finale (uid),
//!   valore nuovo e valore precedente
//! - Rollback del valore se un listener fallisce
//! - `replay(prefix)`: ri-emette tutti i valori, per ricostruire lo stato locale
//! - Persistenza opzionale su file JSON
//!
//! ## Esempio struttura file:
//! ```json
//! {
//!   "imageTransforms.6f1c…": { "name": "Thumb", "handle": "thumb", "mode": "crop", ... }
//! }
//! ```

use crate::error::{Result, TransformError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info};

/// A change to one config path
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEvent {
    pub path: String,
    /// Trailing path segment, e.g. the definition uid
    pub token: String,
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
}

impl ConfigEvent {
    fn new(path: &str, new_value: Option<Value>, old_value: Option<Value>) -> Self {
        Self {
            path: path.to_string(),
            token: path.rsplit('.').next().unwrap_or(path).to_string(),
            new_value,
            old_value,
        }
    }
}

#[async_trait]
pub trait ConfigListener: Send + Sync {
    async fn handle_change(&self, event: &ConfigEvent) -> Result<()>;
}

/// Propagated project configuration
#[derive(Default)]
pub struct ProjectConfig {
    values: Mutex<BTreeMap<String, Value>>,
    listeners: RwLock<Vec<(String, Arc<dyn ConfigListener>)>>,
    file: Option<PathBuf>,
}

impl ProjectConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load values from a JSON file, which is rewritten after every change
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let values = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            values: Mutex::new(values),
            listeners: RwLock::new(Vec::new()),
            file: Some(path),
        })
    }

    /// Register a listener for every path below `prefix`
    pub fn listen(&self, prefix: &str, listener: Arc<dyn ConfigListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((prefix.to_string(), listener));
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.values().get(path).cloned()
    }

    /// All (path, value) pairs below `prefix`
    pub fn entries(&self, prefix: &str) -> Vec<(String, Value)> {
        let scope = format!("{}.", prefix);
        self.values()
            .iter()
            .filter(|(path, _)| path.starts_with(&scope))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect()
    }

    pub async fn set(&self, path: &str, value: Value, description: &str) -> Result<()> {
        let old_value = self.values().insert(path.to_string(), value.clone());
        let event = ConfigEvent::new(path, Some(value), old_value.clone());

        if let Err(e) = self.dispatch(&event).await {
            let mut values = self.values();
            match old_value {
                Some(old) => values.insert(path.to_string(), old),
                None => values.remove(path),
            };
            return Err(e);
        }

        info!("Project config updated: {} ({})", path, description);
        self.persist().await
    }

    pub async fn remove(&self, path: &str, description: &str) -> Result<()> {
        let Some(old_value) = self.values().remove(path) else {
            debug!("Project config path {} already absent", path);
            return Ok(());
        };
        let event = ConfigEvent::new(path, None, Some(old_value.clone()));

        if let Err(e) = self.dispatch(&event).await {
            self.values().insert(path.to_string(), old_value);
            return Err(e);
        }

        info!("Project config removed: {} ({})", path, description);
        self.persist().await
    }

    /// Re-emit every stored value below `prefix`; returns how many were replayed
    pub async fn replay(&self, prefix: &str) -> Result<usize> {
        let entries = self.entries(prefix);
        for (path, value) in &entries {
            let event = ConfigEvent::new(path, Some(value.clone()), Some(value.clone()));
            self.dispatch(&event).await?;
        }
        Ok(entries.len())
    }

    async fn dispatch(&self, event: &ConfigEvent) -> Result<()> {
        let listeners: Vec<Arc<dyn ConfigListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(prefix, _)| event.path.starts_with(&format!("{}.", prefix)))
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener.handle_change(event).await?;
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let Some(ref path) = self.file else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(&*self.values())?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| TransformError::Config(format!("failed to write {}: {}", path.display(), e)))
    }

    fn values(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ConfigEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl ConfigListener for Recorder {
        async fn handle_change(&self, event: &ConfigEvent) -> Result<()> {
            if self.fail {
                return Err(TransformError::Config("listener refused".to_string()));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_set_and_remove_notify_listeners() {
        let config = ProjectConfig::new();
        let recorder = Arc::new(Recorder::default());
        config.listen("imageTransforms", recorder.clone());

        config.set("imageTransforms.abc", json!({"w": 1}), "add").await.unwrap();
        config.set("imageTransforms.abc", json!({"w": 2}), "edit").await.unwrap();
        config.set("other.key", json!(true), "unrelated").await.unwrap();
        config.remove("imageTransforms.abc", "drop").await.unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].token, "abc");
        assert_eq!(events[1].old_value, Some(json!({"w": 1})));
        assert_eq!(events[2].new_value, None);
        assert!(config.get("imageTransforms.abc").is_none());
    }

    #[tokio::test]
    async fn test_failed_listener_rolls_back() {
        let config = ProjectConfig::new();
        config.listen("imageTransforms", Arc::new(Recorder { fail: true, ..Default::default() }));

        assert!(config.set("imageTransforms.abc", json!(1), "add").await.is_err());
        assert!(config.get("imageTransforms.abc").is_none());
    }

    #[tokio::test]
    async fn test_persist_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("project.json");

        let config = ProjectConfig::open(path.clone()).await.unwrap();
        config.set("imageTransforms.a", json!(1), "add").await.unwrap();
        config.set("imageTransforms.b", json!(2), "add").await.unwrap();

        let reopened = ProjectConfig::open(path).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        reopened.listen("imageTransforms", recorder.clone());
        assert_eq!(reopened.replay("imageTransforms").await.unwrap(), 2);
        assert_eq!(recorder.events.lock().unwrap().len(), 2);
    }
}
