//! Scripted providers and a store with injectable failures.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cardsync_adapters::{Page, ProviderClient, ProviderError};
use cardsync_core::{
    CandidateRecord, CardGameType, CatalogRecord, Cursor, Expansion, NaturalKey, Rarity,
};
use cardsync_storage::{CatalogStore, MemoryCatalogStore, StoreError, UpsertOutcome};

pub fn candidate(name: &str) -> CandidateRecord {
    CandidateRecord {
        game: CardGameType::Pokemon,
        name: name.to_string(),
        set_code: "BASE".to_string(),
        card_number: "25".to_string(),
        rarity: Rarity::Common,
        image_url: None,
        description: None,
        mana_cost: None,
        created_at: None,
    }
}

/// `card-0 .. card-{n-1}`, each with its own card number.
pub fn numbered(n: usize) -> Vec<CandidateRecord> {
    (0..n)
        .map(|i| {
            let mut c = candidate(&format!("card-{i}"));
            c.card_number = i.to_string();
            c
        })
        .collect()
}

pub struct ScriptedProvider {
    game: CardGameType,
    cards: Vec<CandidateRecord>,
    delta: bool,
    fail_at: Option<Cursor>,
    stall_at: Option<Cursor>,
    page_delay: Duration,
    panics: bool,
    offsets: Mutex<Vec<u64>>,
}

impl ScriptedProvider {
    pub fn with_cards(game: CardGameType, cards: Vec<CandidateRecord>) -> Self {
        let cards = cards
            .into_iter()
            .map(|mut c| {
                c.game = game;
                c
            })
            .collect();
        Self {
            game,
            cards,
            delta: false,
            fail_at: None,
            stall_at: None,
            page_delay: Duration::ZERO,
            panics: false,
            offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delta(mut self) -> Self {
        self.delta = true;
        self
    }

    pub fn failing_at(mut self, offset: Cursor) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// At `offset`, answers with an empty page that claims more and does not advance.
    pub fn stalling_at(mut self, offset: Cursor) -> Self {
        self.stall_at = Some(offset);
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn requested_offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    fn supports(&self, game: CardGameType) -> bool {
        game == self.game
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
        self.offsets.lock().unwrap().push(offset.0);
        if self.panics {
            panic!("scripted provider blew up");
        }
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
        if !self.supports(game) {
            return Err(ProviderError::Unsupported(game));
        }
        if self.fail_at == Some(offset) {
            return Err(ProviderError::Unavailable(format!("scripted failure at {offset}")));
        }
        if self.stall_at == Some(offset) {
            return Ok(Page {
                records: Vec::new(),
                next_cursor: offset,
                has_more: true,
            });
        }

        let start = (offset.0 as usize).min(self.cards.len());
        let end = (start + page_size).min(self.cards.len());
        let records = self.cards[start..end].to_vec();
        Ok(Page {
            next_cursor: Cursor(offset.0 + records.len() as u64),
            has_more: end < self.cards.len(),
            records,
        })
    }
}

/// Memory catalog that fails chosen `upsert_batch` calls (by call index) and
/// lookups for chosen card names.
#[derive(Default)]
pub struct FlakyCatalogStore {
    inner: MemoryCatalogStore,
    failing_batches: HashSet<usize>,
    failing_names: HashSet<String>,
    batch_calls: AtomicUsize,
}

impl FlakyCatalogStore {
    pub fn failing_batches(indices: &[usize]) -> Self {
        Self {
            failing_batches: indices.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn failing_lookup_for(mut self, name: &str) -> Self {
        self.failing_names.insert(name.to_string());
        self
    }
}

#[async_trait]
impl CatalogStore for FlakyCatalogStore {
    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<CatalogRecord>, StoreError> {
        if self.failing_names.contains(&key.name) {
            return Err(StoreError::Unavailable(format!("lookup failed for {key}")));
        }
        self.inner.find_by_natural_key(key).await
    }

    async fn upsert_batch(&self, records: &[CatalogRecord]) -> Result<UpsertOutcome, StoreError> {
        let call = self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_batches.contains(&call) {
            return Err(StoreError::Unavailable(format!("batch {call} rejected")));
        }
        self.inner.upsert_batch(records).await
    }

    async fn find_expansion(
        &self,
        title: &str,
        game: CardGameType,
    ) -> Result<Option<Expansion>, StoreError> {
        self.inner.find_expansion(title, game).await
    }

    async fn create_expansion(&self, expansion: Expansion) -> Result<Expansion, StoreError> {
        self.inner.create_expansion(expansion).await
    }

    async fn count_records(&self, game: CardGameType) -> Result<u64, StoreError> {
        self.inner.count_records(game).await
    }
}
