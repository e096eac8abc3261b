use std::sync::Arc;

use cardsync_core::CatalogRecord;
use cardsync_storage::{CatalogStore, StoreError, UpsertOutcome};
use thiserror::Error;
use tracing::{debug, error};

pub const DEFAULT_CHUNK_SIZE: usize = 10;

#[derive(Debug, Error)]
#[error("batch of {size} records rolled back: {source}")]
pub struct WriteBatchError {
    pub size: usize,
    #[source]
    pub source: StoreError,
}

/// Buffers merged records and commits them one transaction per chunk.
pub struct ChunkedWriter {
    store: Arc<dyn CatalogStore>,
    chunk_size: usize,
    pending: Vec<CatalogRecord>,
}

impl ChunkedWriter {
    pub fn new(store: Arc<dyn CatalogStore>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            store,
            chunk_size,
            pending: Vec::with_capacity(chunk_size),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queues a record; returns true once the chunk is full and should be flushed.
    pub fn push(&mut self, record: CatalogRecord) -> bool {
        self.pending.push(record);
        self.pending.len() >= self.chunk_size
    }

    /// Commits the pending chunk. A failed chunk is dropped, not retried.
    pub async fn flush(&mut self) -> Result<UpsertOutcome, WriteBatchError> {
        if self.pending.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_size));
        self.write_batch(&batch).await
    }

    pub async fn write_batch(
        &self,
        records: &[CatalogRecord],
    ) -> Result<UpsertOutcome, WriteBatchError> {
        match self.store.upsert_batch(records).await {
            Ok(outcome) => {
                debug!(
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    "batch committed"
                );
                Ok(outcome)
            }
            Err(source) => {
                error!(size = records.len(), error = %source, "batch rolled back");
                Err(WriteBatchError {
                    size: records.len(),
                    source,
                })
            }
        }
    }
}
