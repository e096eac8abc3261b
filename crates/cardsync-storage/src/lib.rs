//! Catalog, progress and lock stores plus the shared HTTP fetch utilities.
//!
//! The pipeline only talks to the narrow capabilities defined here. Two
//! implementations exist for each: an in-memory one used by tests and dry runs,
//! and a Postgres one backed by `sqlx`.

use std::time::Duration;

use async_trait::async_trait;
use cardsync_core::{
    CardGameType, CatalogRecord, Cursor, Expansion, ImportProgress, NaturalKey, RunLock,
};
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RequestPacer,
    RetryDecision,
};
pub use memory::{MemoryCatalogStore, MemoryLockStore, MemoryProgressStore};
pub use postgres::{PgCatalogStore, PgLockStore, PgProgressStore};

pub const CRATE_NAME: &str = "cardsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Row counts produced by one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Catalog persistence as seen by the import pipeline.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_by_natural_key(&self, key: &NaturalKey)
        -> Result<Option<CatalogRecord>, StoreError>;

    /// Writes all records in one transaction, keyed by natural key.
    ///
    /// A record whose key already exists only has `image_url` and `description`
    /// overwritten. Either every record lands or none do.
    async fn upsert_batch(&self, records: &[CatalogRecord]) -> Result<UpsertOutcome, StoreError>;

    async fn find_expansion(
        &self,
        title: &str,
        game: CardGameType,
    ) -> Result<Option<Expansion>, StoreError>;

    /// Get-or-create: returns the stored row when (title, game) already exists.
    async fn create_expansion(&self, expansion: Expansion) -> Result<Expansion, StoreError>;

    async fn count_records(&self, game: CardGameType) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get_cursor(&self, game: CardGameType) -> Result<Option<ImportProgress>, StoreError>;

    /// Atomically moves the stored cursor forward; a lower cursor never replaces a higher one.
    async fn advance_cursor(
        &self,
        game: CardGameType,
        cursor: Cursor,
        complete: bool,
    ) -> Result<ImportProgress, StoreError>;

    async fn list(&self) -> Result<Vec<ImportProgress>, StoreError>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Creates the lock unless an unexpired one with the same name exists. Never waits.
    async fn try_acquire(&self, name: &str, holder_id: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Pushes the expiry to `now + ttl` only if `holder_id` still owns the lock.
    async fn extend(&self, name: &str, holder_id: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Deletes the lock only if `holder_id` still owns it.
    async fn release(&self, name: &str, holder_id: &str) -> Result<bool, StoreError>;

    async fn purge_expired(&self) -> Result<u64, StoreError>;

    async fn current(&self, name: &str) -> Result<Option<RunLock>, StoreError>;
}

pub(crate) fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(6))
}
