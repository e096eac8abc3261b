//! In-process stores with the same atomicity guarantees as the Postgres ones.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use cardsync_core::{
    CardGameType, CatalogRecord, Cursor, Expansion, ImportProgress, NaturalKey, RunLock,
};
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{ttl_to_chrono, CatalogStore, LockStore, ProgressStore, StoreError, UpsertOutcome};

#[derive(Debug, Default)]
struct CatalogState {
    records: BTreeMap<NaturalKey, CatalogRecord>,
    expansions: BTreeMap<(CardGameType, String), Expansion>,
}

#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<CatalogState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self, game: CardGameType) -> Vec<CatalogRecord> {
        let state = self.state.lock().await;
        state
            .records
            .values()
            .filter(|r| r.game == game)
            .cloned()
            .collect()
    }

    pub async fn expansions(&self) -> Vec<Expansion> {
        self.state.lock().await.expansions.values().cloned().collect()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<CatalogRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(key).cloned())
    }

    async fn upsert_batch(&self, records: &[CatalogRecord]) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let mut outcome = UpsertOutcome::default();
        for record in records {
            match state.records.get_mut(&record.natural_key()) {
                Some(existing) => {
                    existing.image_url = record.image_url.clone();
                    existing.description = record.description.clone();
                    outcome.updated += 1;
                }
                None => {
                    state.records.insert(record.natural_key(), record.clone());
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn find_expansion(
        &self,
        title: &str,
        game: CardGameType,
    ) -> Result<Option<Expansion>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.expansions.get(&(game, title.to_string())).cloned())
    }

    async fn create_expansion(&self, expansion: Expansion) -> Result<Expansion, StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .expansions
            .entry((expansion.game, expansion.title.clone()))
            .or_insert(expansion);
        Ok(stored.clone())
    }

    async fn count_records(&self, game: CardGameType) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.keys().filter(|k| k.game == game).count() as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    rows: Mutex<BTreeMap<CardGameType, ImportProgress>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get_cursor(&self, game: CardGameType) -> Result<Option<ImportProgress>, StoreError> {
        Ok(self.rows.lock().await.get(&game).cloned())
    }

    async fn advance_cursor(
        &self,
        game: CardGameType,
        cursor: Cursor,
        complete: bool,
    ) -> Result<ImportProgress, StoreError> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();
        let row = rows.entry(game).or_insert(ImportProgress {
            game,
            cursor: Cursor::START,
            complete: false,
            last_run_at: now,
        });
        row.cursor = row.cursor.max(cursor);
        row.complete = complete;
        row.last_run_at = now;
        Ok(row.clone())
    }

    async fn list(&self) -> Result<Vec<ImportProgress>, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    locks: Mutex<BTreeMap<String, RunLock>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().await;
        let now = Utc::now();
        if let Some(existing) = locks.get(name) {
            if !existing.is_expired_at(now) {
                return Ok(false);
            }
        }
        locks.insert(
            name.to_string(),
            RunLock {
                name: name.to_string(),
                holder_id: holder_id.to_string(),
                acquired_at: now,
                expires_at: now + ttl_to_chrono(ttl),
            },
        );
        Ok(true)
    }

    async fn extend(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(name) {
            Some(lock) if lock.holder_id == holder_id => {
                lock.expires_at = Utc::now() + ttl_to_chrono(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, holder_id: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().await;
        match locks.get(name) {
            Some(lock) if lock.holder_id == holder_id => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut locks = self.locks.lock().await;
        let now = Utc::now();
        let before = locks.len();
        locks.retain(|_, lock| !lock.is_expired_at(now));
        Ok((before - locks.len()) as u64)
    }

    async fn current(&self, name: &str) -> Result<Option<RunLock>, StoreError> {
        Ok(self.locks.lock().await.get(name).cloned())
    }
}
