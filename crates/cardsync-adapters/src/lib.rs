//! Provider capability contracts plus the HTTP and fixture-backed card feeds.

use async_trait::async_trait;
use cardsync_core::{CandidateRecord, CardGameType, Cursor, Rarity};
use cardsync_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fixture;
pub mod http_api;
pub mod registry;

pub use fixture::FixtureProvider;
pub use http_api::{default_game_id, HttpCardApiClient};
pub use registry::{
    build_registry, load_providers_file, ProviderConfig, ProviderKind, ProviderRegistry,
    ProvidersFile,
};

pub const CRATE_NAME: &str = "cardsync-adapters";

/// Set codes and card numbers the feed leaves blank are stored as this.
pub const MISSING_FIELD: &str = "N/A";

/// One page of candidates plus where the next request should start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<CandidateRecord>,
    pub next_cursor: Cursor,
    pub has_more: bool,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no provider capability for {0}")]
    Unsupported(CardGameType),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("could not decode provider payload: {0}")]
    Decode(String),
    #[error("provider io error: {0}")]
    Io(String),
}

/// What the pipeline needs from a card-data provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider_id(&self) -> &str;

    fn supports(&self, game: CardGameType) -> bool;

    fn supports_delta(&self, _game: CardGameType) -> bool {
        false
    }

    async fn fetch_page(
        &self,
        game: CardGameType,
        offset: Cursor,
        page_size: usize,
    ) -> Result<Page, ProviderError>;

    /// Records after `since`. Offset-based feeds page forward from the cursor.
    async fn fetch_delta(
        &self,
        game: CardGameType,
        since: Cursor,
        page_size: usize,
    ) -> Result<Page, ProviderError> {
        self.fetch_page(game, since, page_size).await
    }
}

/// A card as the upstream card-data API returns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCard {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub set: Option<String>,
    #[serde(default, rename = "set_name")]
    pub set_name: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub rarity: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default, rename = "imageUrl", alias = "image_url")]
    pub image_url: Option<String>,
    #[serde(default, rename = "manaCost", alias = "mana_cost")]
    pub mana_cost: Option<i32>,
}

impl ProviderCard {
    /// Normalizes the card, or returns `None` when it has no usable name.
    ///
    /// The set name travels inside the description as an `[Expansion: ...]` tag
    /// so the merger can resolve it against the catalog.
    pub fn into_candidate(self, game: CardGameType) -> Option<CandidateRecord> {
        let name = self.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())?;

        let details = non_blank(self.details);
        let description = match (details, non_blank(self.set_name)) {
            (Some(details), Some(set_name)) => Some(format!("{details} [Expansion: {set_name}]")),
            (None, Some(set_name)) => Some(format!("[Expansion: {set_name}]")),
            (details, None) => details,
        };

        Some(CandidateRecord {
            game,
            name,
            set_code: non_blank(self.set).unwrap_or_else(|| MISSING_FIELD.to_string()),
            card_number: non_blank(self.number).unwrap_or_else(|| MISSING_FIELD.to_string()),
            rarity: self
                .rarity
                .as_deref()
                .map(Rarity::normalize)
                .unwrap_or(Rarity::Common),
            image_url: non_blank(self.image_url),
            description,
            mana_cost: self.mana_cost,
            created_at: None,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Turns one raw page into a [`Page`]. The cursor moves past every raw card,
/// including the ones dropped for lacking a name.
pub(crate) fn page_from_cards(
    game: CardGameType,
    offset: Cursor,
    cards: Vec<ProviderCard>,
    has_more: bool,
) -> Page {
    let raw_len = cards.len() as u64;
    let records = cards
        .into_iter()
        .filter_map(|card| card.into_candidate(game))
        .collect();
    Page {
        records,
        next_cursor: Cursor(offset.offset() + raw_len),
        has_more: has_more && raw_len > 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(name: &str) -> ProviderCard {
        ProviderCard {
            name: Some(name.to_string()),
            set: Some("BASE".to_string()),
            number: Some("25".to_string()),
            ..ProviderCard::default()
        }
    }

    #[test]
    fn set_name_is_embedded_as_expansion_tag() {
        let candidate = ProviderCard {
            details: Some("A cute mouse.".to_string()),
            set_name: Some("Base Set".to_string()),
            rarity: Some("Rare Holo".to_string()),
            ..card("Pikachu")
        }
        .into_candidate(CardGameType::Pokemon)
        .unwrap();

        assert_eq!(
            candidate.description.as_deref(),
            Some("A cute mouse. [Expansion: Base Set]")
        );
        assert_eq!(candidate.rarity, Rarity::Rare);
        assert_eq!(candidate.card_number, "25");
    }

    #[test]
    fn nameless_cards_are_dropped_and_blank_fields_defaulted() {
        assert!(card("   ").into_candidate(CardGameType::Magic).is_none());

        let candidate = ProviderCard {
            name: Some("Island".to_string()),
            ..ProviderCard::default()
        }
        .into_candidate(CardGameType::Magic)
        .unwrap();
        assert_eq!(candidate.set_code, MISSING_FIELD);
        assert_eq!(candidate.card_number, MISSING_FIELD);
        assert_eq!(candidate.description, None);
    }

    #[test]
    fn page_cursor_counts_skipped_cards() {
        let page = page_from_cards(
            CardGameType::Pokemon,
            Cursor(40),
            vec![card("Pikachu"), ProviderCard::default()],
            true,
        );
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_cursor, Cursor(42));
        assert!(page.has_more);

        let empty = page_from_cards(CardGameType::Pokemon, Cursor(42), Vec::new(), true);
        assert!(!empty.has_more);
        assert_eq!(empty.next_cursor, Cursor(42));
    }

    #[test]
    fn provider_card_accepts_api_field_names() {
        let json = r#"{
            "name": "Sol Ring",
            "set": "C21",
            "set_name": "Commander 2021",
            "number": "263",
            "rarity": "Uncommon",
            "imageUrl": "https://img/sol.png",
            "manaCost": 1,
            "variants": []
        }"#;
        let card: ProviderCard = serde_json::from_str(json).unwrap();
        assert_eq!(card.image_url.as_deref(), Some("https://img/sol.png"));
        assert_eq!(card.mana_cost, Some(1));
    }
}
