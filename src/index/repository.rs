//! # Index Repository Module
//!
//! Questo modulo gestisce la persistenza delle righe `TransformIndex`.
//!
//! ## Responsabilità:
//! - Definisce il trait `IndexRepository`, unico punto di coordinamento tra worker
//! - Fornisce le primitive compare-and-set `try_claim` e `take_over`
//!   (in un backend SQL: un singolo UPDATE con clausola WHERE)
//! - `InMemoryIndexRepository`: implementazione in memoria con snapshot JSON opzionale
//!
//! ## Strategia di persistence:
//! - Un file JSON per directory di asset (basato su hash del path)
//! - Salvataggio in `~/.asset-transforms/indexes_<hash>.json`
//! - Le righe sono istruzioni singole, non avvolte in transazioni più ampie

use crate::clock::Clock;
use crate::error::{Result, TransformError};
use crate::index::record::TransformIndex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tracing::debug;

/// Storage of transform index rows
#[async_trait]
pub trait IndexRepository: Send + Sync {
    async fn find(
        &self,
        volume_id: &str,
        asset_id: i64,
        location: &str,
        format: Option<&str>,
    ) -> Result<Option<TransformIndex>>;

    async fn find_by_id(&self, id: i64) -> Result<Option<TransformIndex>>;

    /// Batch lookup used by eager loading
    async fn find_for_assets(&self, asset_ids: &[i64], locations: &[String]) -> Result<Vec<TransformIndex>>;

    async fn find_by_asset(&self, asset_id: i64) -> Result<Vec<TransformIndex>>;

    async fn find_by_location(&self, location: &str) -> Result<Vec<TransformIndex>>;

    /// Insert a new row, assigning its id
    async fn insert(&self, index: TransformIndex) -> Result<TransformIndex>;

    /// Persist the row and stamp `date_updated`
    async fn update(&self, index: &TransformIndex) -> Result<TransformIndex>;

    /// Set `in_progress` if the row is idle, not generated and not failed
    async fn try_claim(&self, id: i64) -> Result<Option<TransformIndex>>;

    /// Re-claim an in-progress row whose `date_updated` still equals the observed value
    async fn take_over(&self, id: i64, observed_updated: DateTime<Utc>) -> Result<Option<TransformIndex>>;

    async fn delete(&self, id: i64) -> Result<()>;

    async fn delete_many(&self, ids: &[i64]) -> Result<usize>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexTable {
    next_id: i64,
    rows: BTreeMap<i64, TransformIndex>,
}

/// In-memory index store, optionally snapshotted to a JSON file
pub struct InMemoryIndexRepository {
    table: Mutex<IndexTable>,
    clock: Arc<dyn Clock>,
    snapshot_path: Option<PathBuf>,
}

impl InMemoryIndexRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(IndexTable::default()),
            clock,
            snapshot_path: None,
        }
    }

    /// Open (or create) the snapshot kept for an asset directory
    pub async fn open_for_directory(asset_dir: &Path, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let state_dir = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?
            .join(".asset-transforms");

        fs::create_dir_all(&state_dir).await?;

        let mut hasher = Sha256::new();
        hasher.update(asset_dir.to_string_lossy().as_bytes());
        let hash = hex::encode(hasher.finalize())[..16].to_string();

        Self::open(state_dir.join(format!("indexes_{}.json", hash)), clock).await
    }

    /// Open a snapshot file; a missing or unreadable file starts empty
    pub async fn open(path: PathBuf, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let table = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            IndexTable::default()
        };

        debug!("Loaded {} transform indexes from {}", table.rows.len(), path.display());

        Ok(Self {
            table: Mutex::new(table),
            clock,
            snapshot_path: Some(path),
        })
    }

    /// Write the snapshot file, if one is configured
    pub async fn flush(&self) -> anyhow::Result<()> {
        let Some(ref path) = self.snapshot_path else {
            return Ok(());
        };
        let content = {
            let table = self.lock();
            serde_json::to_string_pretty(&*table)?
        };
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, IndexTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select<F>(&self, predicate: F) -> Vec<TransformIndex>
    where
        F: Fn(&TransformIndex) -> bool,
    {
        self.lock().rows.values().filter(|row| predicate(row)).cloned().collect()
    }
}

#[async_trait]
impl IndexRepository for InMemoryIndexRepository {
    async fn find(
        &self,
        volume_id: &str,
        asset_id: i64,
        location: &str,
        format: Option<&str>,
    ) -> Result<Option<TransformIndex>> {
        Ok(self
            .select(|row| row.volume_id == volume_id && row.asset_id == asset_id && row.matches(location, format))
            .into_iter()
            .next())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<TransformIndex>> {
        Ok(self.lock().rows.get(&id).cloned())
    }

    async fn find_for_assets(&self, asset_ids: &[i64], locations: &[String]) -> Result<Vec<TransformIndex>> {
        Ok(self.select(|row| asset_ids.contains(&row.asset_id) && locations.contains(&row.location)))
    }

    async fn find_by_asset(&self, asset_id: i64) -> Result<Vec<TransformIndex>> {
        Ok(self.select(|row| row.asset_id == asset_id))
    }

    async fn find_by_location(&self, location: &str) -> Result<Vec<TransformIndex>> {
        Ok(self.select(|row| row.location == location))
    }

    async fn insert(&self, mut index: TransformIndex) -> Result<TransformIndex> {
        let mut table = self.lock();
        table.next_id += 1;
        index.id = table.next_id;
        table.rows.insert(index.id, index.clone());
        Ok(index)
    }

    async fn update(&self, index: &TransformIndex) -> Result<TransformIndex> {
        let now = self.clock.now();
        let mut table = self.lock();
        let row = table.rows.get_mut(&index.id).ok_or_else(|| {
            TransformError::IndexResolutionFailed(format!("transform index {} no longer exists", index.id))
        })?;
        *row = index.clone();
        row.date_updated = now;
        Ok(row.clone())
    }

    async fn try_claim(&self, id: i64) -> Result<Option<TransformIndex>> {
        let now = self.clock.now();
        let mut table = self.lock();
        Ok(table.rows.get_mut(&id).and_then(|row| {
            if row.in_progress || row.file_exists || row.error {
                return None;
            }
            row.in_progress = true;
            row.date_updated = now;
            Some(row.clone())
        }))
    }

    async fn take_over(&self, id: i64, observed_updated: DateTime<Utc>) -> Result<Option<TransformIndex>> {
        let now = self.clock.now();
        let mut table = self.lock();
        Ok(table.rows.get_mut(&id).and_then(|row| {
            if !row.in_progress || row.date_updated != observed_updated {
                return None;
            }
            row.date_updated = now;
            Some(row.clone())
        }))
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.lock().rows.remove(&id);
        Ok(())
    }

    async fn delete_many(&self, ids: &[i64]) -> Result<usize> {
        let mut table = self.lock();
        Ok(ids.iter().filter(|id| table.rows.remove(id).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::index::record::Asset;
    use tempfile::TempDir;

    fn repo() -> InMemoryIndexRepository {
        InMemoryIndexRepository::new(Arc::new(SystemClock))
    }

    fn index(asset_id: i64, location: &str) -> TransformIndex {
        let asset = Asset::new(asset_id, "uploads", "", "a.jpg", Utc::now());
        TransformIndex::new(&asset, location, None, Utc::now())
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let repo = repo();
        let a = repo.insert(index(1, "_thumb")).await.unwrap();
        let b = repo.insert(index(1, "_hero")).await.unwrap();
        assert_ne!(a.id, b.id);

        let found = repo.find("uploads", 1, "_thumb", None).await.unwrap().unwrap();
        assert_eq!(found.id, a.id);
        assert!(repo.find("uploads", 1, "_thumb", Some("png")).await.unwrap().is_none());
        assert!(repo.find("other", 1, "_thumb", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let repo = repo();
        let row = repo.insert(index(1, "_thumb")).await.unwrap();

        let claimed = repo.try_claim(row.id).await.unwrap().unwrap();
        assert!(claimed.in_progress);
        assert!(repo.try_claim(row.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_take_over_requires_observed_timestamp() {
        let repo = repo();
        let row = repo.insert(index(1, "_thumb")).await.unwrap();
        let claimed = repo.try_claim(row.id).await.unwrap().unwrap();

        let stale = claimed.date_updated - chrono::Duration::seconds(5);
        assert!(repo.take_over(row.id, stale).await.unwrap().is_none());
        assert!(repo.take_over(row.id, claimed.date_updated).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_batch_queries_and_delete() {
        let repo = repo();
        let a = repo.insert(index(1, "_thumb")).await.unwrap();
        let b = repo.insert(index(2, "_thumb")).await.unwrap();
        repo.insert(index(3, "_hero")).await.unwrap();

        let rows = repo.find_for_assets(&[1, 2, 3], &["_thumb".to_string()]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(repo.find_by_location("_hero").await.unwrap().len(), 1);

        assert_eq!(repo.delete_many(&[a.id, b.id, 999]).await.unwrap(), 2);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_row_fails() {
        let repo = repo();
        let mut row = index(1, "_thumb");
        row.id = 42;
        assert!(repo.update(&row).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("indexes.json");

        let repo = InMemoryIndexRepository::open(path.clone(), Arc::new(SystemClock)).await.unwrap();
        let row = repo.insert(index(5, "_thumb")).await.unwrap();
        repo.flush().await.unwrap();

        let reopened = InMemoryIndexRepository::open(path, Arc::new(SystemClock)).await.unwrap();
        assert_eq!(reopened.find_by_id(row.id).await.unwrap(), Some(row));
        let next = reopened.insert(index(6, "_thumb")).await.unwrap();
        assert!(next.id > 1);
    }
}
