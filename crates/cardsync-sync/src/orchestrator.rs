//! Drives reader, merger and writer for one card game.

use std::sync::Arc;
use std::time::Duration;

use cardsync_adapters::ProviderClient;
use cardsync_core::{CardGameType, Cursor, ImportMode, TypeRunStatus};
use cardsync_storage::{CatalogStore, ProgressStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::merger::RecordMerger;
use crate::reader::{ReadTermination, ReaderSettings, SourceReader};
use crate::stats::StatsSink;
use crate::writer::ChunkedWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportState {
    Idle,
    Reading,
    Merging,
    Writing,
    AdvancingProgress,
    Done,
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("provider unavailable for {game}: {reason}")]
    ProviderUnavailable { game: CardGameType, reason: String },
    #[error("progress store error: {0}")]
    Progress(#[from] StoreError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("import task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCounts {
    pub attempted: u64,
    /// inserted + updated
    pub imported: u64,
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ImportSettings {
    pub chunk_size: usize,
    pub page_size: usize,
    pub max_pages: Option<usize>,
    pub type_timeout: Duration,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            chunk_size: crate::writer::DEFAULT_CHUNK_SIZE,
            page_size: 20,
            max_pages: Some(1000),
            type_timeout: Duration::from_secs(4 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRunReport {
    pub game: CardGameType,
    pub mode: ImportMode,
    pub status: TypeRunStatus,
    pub counts: TypeCounts,
    pub cursor_before: Option<Cursor>,
    pub cursor_after: Option<Cursor>,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TypeRunReport {
    pub fn not_attempted(game: CardGameType, mode: ImportMode) -> Self {
        let now = Utc::now();
        Self {
            game,
            mode,
            status: TypeRunStatus::NotAttempted,
            counts: TypeCounts::default(),
            cursor_before: None,
            cursor_after: None,
            reason: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn failed(
        game: CardGameType,
        mode: ImportMode,
        reason: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: TypeRunStatus::Failed,
            reason: Some(reason.into()),
            started_at,
            finished_at: Utc::now(),
            ..Self::not_attempted(game, mode)
        }
    }
}

struct DriveOutcome {
    cursor_after: Cursor,
}

pub struct TypeOrchestrator {
    catalog: Arc<dyn CatalogStore>,
    progress: Arc<dyn ProgressStore>,
    stats: Arc<dyn StatsSink>,
    settings: ImportSettings,
}

impl TypeOrchestrator {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        progress: Arc<dyn ProgressStore>,
        stats: Arc<dyn StatsSink>,
        settings: ImportSettings,
    ) -> Self {
        Self {
            catalog,
            progress,
            stats,
            settings,
        }
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    /// Runs one import for `game`. Never returns an error: every failure ends
    /// up in the report and the stats sink.
    pub async fn run(
        &self,
        game: CardGameType,
        mode: ImportMode,
        provider: Option<Arc<dyn ProviderClient>>,
    ) -> TypeRunReport {
        let Some(provider) = provider else {
            info!(%game, "import not implemented for this game; skipping");
            self.stats.record_not_attempted(game);
            return TypeRunReport::not_attempted(game, mode);
        };

        let started_at = Utc::now();
        self.stats.record_start(game);
        let span = info_span!("import_type", %game, %mode, provider_id = provider.provider_id());

        async move {
            let cursor_before = match self.progress.get_cursor(game).await {
                Ok(row) => row.map(|p| p.cursor),
                Err(err) => {
                    let err = ImportError::from(err);
                    return self.fail(game, mode, err, TypeCounts::default(), None, started_at);
                }
            };

            let mut counts = TypeCounts::default();
            let drive = self.drive(
                game,
                mode,
                provider,
                cursor_before.unwrap_or_default(),
                &mut counts,
            );
            let result = match tokio::time::timeout(self.settings.type_timeout, drive).await {
                Ok(result) => result,
                Err(_) => Err(ImportError::Timeout(self.settings.type_timeout)),
            };

            match result {
                Ok(outcome) => {
                    self.stats.record_success(game, &counts);
                    TypeRunReport {
                        game,
                        mode,
                        status: TypeRunStatus::Success,
                        counts,
                        cursor_before,
                        cursor_after: Some(outcome.cursor_after),
                        reason: None,
                        started_at,
                        finished_at: Utc::now(),
                    }
                }
                Err(err) => self.fail(game, mode, err, counts, cursor_before, started_at),
            }
        }
        .instrument(span)
        .await
    }

    fn fail(
        &self,
        game: CardGameType,
        mode: ImportMode,
        err: ImportError,
        counts: TypeCounts,
        cursor_before: Option<Cursor>,
        started_at: DateTime<Utc>,
    ) -> TypeRunReport {
        let reason = err.to_string();
        debug!(%game, state = ?ImportState::Failed(reason.clone()), "import state");
        self.stats.record_failure(game, &reason, &counts);
        TypeRunReport {
            counts,
            cursor_before,
            cursor_after: cursor_before,
            ..TypeRunReport::failed(game, mode, reason, started_at)
        }
    }

    async fn drive(
        &self,
        game: CardGameType,
        mode: ImportMode,
        provider: Arc<dyn ProviderClient>,
        stored: Cursor,
        counts: &mut TypeCounts,
    ) -> Result<DriveOutcome, ImportError> {
        let mut state = ImportState::Idle;
        let mut reader = SourceReader::open(
            game,
            mode,
            Some(provider),
            stored,
            ReaderSettings {
                page_size: self.settings.page_size,
                max_pages: self.settings.max_pages,
            },
        );
        let mut merger = RecordMerger::new(self.catalog.clone());
        let mut writer = ChunkedWriter::new(self.catalog.clone(), self.settings.chunk_size);

        transition(game, &mut state, ImportState::Reading);
        while let Some(candidate) = reader.next().await {
            counts.attempted += 1;
            transition(game, &mut state, ImportState::Merging);
            match merger.merge(candidate).await {
                Ok(merged) => {
                    if writer.push(merged.record) {
                        transition(game, &mut state, ImportState::Writing);
                        flush(&mut writer, counts).await;
                    }
                }
                Err(err) => {
                    counts.failed += 1;
                    warn!(%game, error = %err, "record dropped");
                }
            }
            transition(game, &mut state, ImportState::Reading);
        }

        transition(game, &mut state, ImportState::Writing);
        flush(&mut writer, counts).await;

        let complete = match reader.termination() {
            Some(ReadTermination::ProviderFailed(reason)) => {
                return Err(ImportError::ProviderUnavailable {
                    game,
                    reason: reason.clone(),
                });
            }
            Some(ReadTermination::Exhausted) => true,
            Some(ReadTermination::Stalled | ReadTermination::PageCeiling) => false,
            Some(ReadTermination::Unsupported) | None => false,
        };

        transition(game, &mut state, ImportState::AdvancingProgress);
        let row = self
            .progress
            .advance_cursor(game, reader.cursor(), complete)
            .await?;
        transition(game, &mut state, ImportState::Done);

        info!(
            %game,
            pages = reader.pages_fetched(),
            cursor = %row.cursor,
            complete,
            imported = counts.imported,
            failed = counts.failed,
            "type import finished"
        );
        Ok(DriveOutcome {
            cursor_after: row.cursor,
        })
    }
}

async fn flush(writer: &mut ChunkedWriter, counts: &mut TypeCounts) {
    let size = writer.pending_len() as u64;
    match writer.flush().await {
        Ok(outcome) => {
            counts.inserted += outcome.inserted as u64;
            counts.updated += outcome.updated as u64;
            counts.imported += outcome.total() as u64;
        }
        Err(_) => counts.failed += size,
    }
}

fn transition(game: CardGameType, state: &mut ImportState, next: ImportState) {
    if *state != next {
        debug!(%game, from = ?state, to = ?next, "import state");
        *state = next;
    }
}
