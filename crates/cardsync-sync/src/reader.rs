//! Pull-based page reader over one provider feed.

use std::collections::VecDeque;
use std::sync::Arc;

use cardsync_adapters::ProviderClient;
use cardsync_core::{CandidateRecord, CardGameType, Cursor, ImportMode};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    pub page_size: usize,
    pub max_pages: Option<usize>,
}

/// Why a reader stopped yielding records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadTermination {
    /// The provider reported no further pages.
    Exhausted,
    /// The configured page ceiling was reached.
    PageCeiling,
    /// The provider claimed more pages but its cursor did not move.
    Stalled,
    /// No provider capability for the game.
    Unsupported,
    /// A page fetch failed; records yielded before it remain valid.
    ProviderFailed(String),
}

pub struct SourceReader {
    game: CardGameType,
    mode: ImportMode,
    provider: Option<Arc<dyn ProviderClient>>,
    settings: ReaderSettings,
    cursor: Cursor,
    buffer: VecDeque<CandidateRecord>,
    pages_fetched: usize,
    termination: Option<ReadTermination>,
}

impl SourceReader {
    /// FULL always starts at offset 0. DELTA starts at `stored`.
    pub fn open(
        game: CardGameType,
        mode: ImportMode,
        provider: Option<Arc<dyn ProviderClient>>,
        stored: Cursor,
        settings: ReaderSettings,
    ) -> Self {
        let cursor = match mode {
            ImportMode::Full => Cursor::START,
            ImportMode::Delta => stored,
        };
        Self {
            game,
            mode,
            provider,
            settings,
            cursor,
            buffer: VecDeque::new(),
            pages_fetched: 0,
            termination: None,
        }
    }

    /// Position after the last page fetched.
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn termination(&self) -> Option<&ReadTermination> {
        self.termination.as_ref()
    }

    pub async fn next(&mut self) -> Option<CandidateRecord> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(record);
            }
            if self.termination.is_some() {
                return None;
            }
            self.fetch_next_page().await;
        }
    }

    async fn fetch_next_page(&mut self) {
        let Some(provider) = self.provider.clone() else {
            self.termination = Some(ReadTermination::Unsupported);
            return;
        };
        if self
            .settings
            .max_pages
            .is_some_and(|max| self.pages_fetched >= max)
        {
            debug!(game = %self.game, pages = self.pages_fetched, "page ceiling reached");
            self.termination = Some(ReadTermination::PageCeiling);
            return;
        }

        let page_size = self.settings.page_size.max(1);
        let result = match self.mode {
            ImportMode::Full => provider.fetch_page(self.game, self.cursor, page_size).await,
            ImportMode::Delta => provider.fetch_delta(self.game, self.cursor, page_size).await,
        };

        match result {
            Ok(page) => {
                self.pages_fetched += 1;
                let stalled = page.next_cursor <= self.cursor;
                self.cursor = self.cursor.max(page.next_cursor);
                self.buffer.extend(page.records);

                if !page.has_more {
                    self.termination = Some(ReadTermination::Exhausted);
                } else if stalled {
                    warn!(
                        game = %self.game,
                        cursor = %self.cursor,
                        "provider cursor did not move; stopping"
                    );
                    self.termination = Some(ReadTermination::Stalled);
                }
            }
            Err(err) => {
                warn!(
                    game = %self.game,
                    provider_id = provider.provider_id(),
                    cursor = %self.cursor,
                    error = %err,
                    "page fetch failed; ending read early"
                );
                self.termination = Some(ReadTermination::ProviderFailed(err.to_string()));
            }
        }
    }
}
