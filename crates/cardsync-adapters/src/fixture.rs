//! Offline provider serving `<dir>/<game-slug>.json` page by page.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cardsync_core::{CardGameType, Cursor};
use tracing::debug;

use crate::{page_from_cards, Page, ProviderCard, ProviderClient, ProviderError};

#[derive(Debug, Clone)]
pub struct FixtureProvider {
    provider_id: String,
    dir: PathBuf,
    games: Vec<CardGameType>,
    delta: bool,
}

impl FixtureProvider {
    pub fn new(
        provider_id: impl Into<String>,
        dir: impl Into<PathBuf>,
        games: &[CardGameType],
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            dir: dir.into(),
            games: games.to_vec(),
            delta: false,
        }
    }

    pub fn with_delta(mut self, delta: bool) -> Self {
        self.delta = delta;
        self
    }

    pub fn fixture_path(&self, game: CardGameType) -> PathBuf {
        self.dir.join(format!("{}.json", game.slug()))
    }

    async fn load_cards(&self, path: &Path) -> Result<Vec<ProviderCard>, ProviderError> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| ProviderError::Io(format!("reading {}: {err}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|err| ProviderError::Decode(format!("parsing {}: {err}", path.display())))
    }
}

#[async_trait]
impl ProviderClient for FixtureProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn supports(&self, game: CardGameType) -> bool {
        self.games.contains(&game)
    }

    fn supports_delta(&self, game: CardGameType) -> bool {
        self.delta && self.supports(game)
    }

    async fn fetch_page(
        &self,
        game: CardGameType,
        offset: Cursor,
        page_size: usize,
    ) -> Result<Page, ProviderError> {
        if !self.supports(game) {
            return Err(ProviderError::Unsupported(game));
        }
        let path = self.fixture_path(game);
        let cards = self.load_cards(&path).await?;

        let total = cards.len();
        let start = usize::try_from(offset.offset()).unwrap_or(usize::MAX).min(total);
        let end = start.saturating_add(page_size.max(1)).min(total);
        debug!(provider_id = %self.provider_id, %game, start, end, total, "serving fixture page");

        let slice = cards[start..end].to_vec();
        Ok(page_from_cards(game, offset, slice, end < total))
    }
}
