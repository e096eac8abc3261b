//! Client for the JSON card-data API (`GET /cards?game=&offset=&limit=`).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cardsync_core::{CardGameType, Cursor};
use cardsync_storage::HttpFetcher;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{page_from_cards, Page, ProviderCard, ProviderClient, ProviderError};

/// Game identifiers the card-data API expects in its `game` parameter.
pub fn default_game_id(game: CardGameType) -> &'static str {
    match game {
        CardGameType::Pokemon => "pokemon",
        CardGameType::OnePiece => "one-piece-card-game",
        CardGameType::Magic => "magic-the-gathering",
        CardGameType::YuGiOh => "yugioh",
        CardGameType::Digimon => "digimon-card-game",
        CardGameType::Lorcana => "disney-lorcana",
        CardGameType::Riftbound => "riftbound-league-of-legends-trading-card-game",
    }
}

#[derive(Debug, Deserialize)]
struct CardsResponse {
    #[serde(default)]
    data: Option<Vec<ProviderCard>>,
    #[serde(default)]
    cards: Option<Vec<ProviderCard>>,
    #[serde(default, rename = "hasMore", alias = "has_more")]
    has_more: Option<bool>,
}

impl CardsResponse {
    /// Without a `hasMore` flag, paging continues until an empty page.
    fn into_cards(self) -> (Vec<ProviderCard>, bool) {
        let cards = self.data.or(self.cards).unwrap_or_default();
        let has_more = self.has_more.unwrap_or(!cards.is_empty());
        (cards, has_more)
    }
}

#[derive(Debug)]
pub struct HttpCardApiClient {
    provider_id: String,
    base_url: String,
    api_key: Option<String>,
    game_ids: BTreeMap<CardGameType, String>,
    delta: bool,
    fetcher: Arc<HttpFetcher>,
}

impl HttpCardApiClient {
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        games: &[CardGameType],
        fetcher: Arc<HttpFetcher>,
    ) -> Self {
        let game_ids = games
            .iter()
            .map(|game| (*game, default_game_id(*game).to_string()))
            .collect();
        Self {
            provider_id: provider_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            game_ids,
            delta: false,
            fetcher,
        }
    }

    pub fn with_delta(mut self, delta: bool) -> Self {
        self.delta = delta;
        self
    }

    /// Overrides the upstream identifier for one game.
    pub fn with_game_id(mut self, game: CardGameType, game_id: impl Into<String>) -> Self {
        self.game_ids.insert(game, game_id.into());
        self
    }

    fn cards_url(&self, game_id: &str, offset: Cursor, page_size: usize) -> String {
        format!(
            "{}/cards?game={}&offset={}&limit={}",
            self.base_url,
            game_id,
            offset.offset(),
            page_size
        )
    }
}

#[async_trait]
impl ProviderClient for HttpCardApiClient {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn supports(&self, game: CardGameType) -> bool {
        self.game_ids.contains_key(&game)
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
        let game_id = self
            .game_ids
            .get(&game)
            .ok_or(ProviderError::Unsupported(game))?;
        let url = self.cards_url(game_id, offset, page_size);

        let mut headers = Vec::new();
        if let Some(key) = &self.api_key {
            headers.push(("x-api-key", key.as_str()));
        }

        debug!(provider_id = %self.provider_id, %game, %offset, "requesting card page");
        let response: CardsResponse = self
            .fetcher
            .fetch_json(&self.provider_id, &url, &headers)
            .await?;
        let (cards, has_more) = response.into_cards();
        let page = page_from_cards(game, offset, cards, has_more);
        info!(
            provider_id = %self.provider_id,
            %game,
            %offset,
            records = page.records.len(),
            has_more = page.has_more,
            "fetched card page"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use cardsync_storage::HttpClientConfig;

    use super::*;

    fn client() -> HttpCardApiClient {
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        HttpCardApiClient::new(
            "card-api",
            "https://api.example.test/v1/",
            Some("secret".to_string()),
            &[CardGameType::Pokemon, CardGameType::OnePiece],
            fetcher,
        )
    }

    #[test]
    fn builds_offset_paged_urls() {
        let client = client();
        assert_eq!(
            client.cards_url("pokemon", Cursor(40), 20),
            "https://api.example.test/v1/cards?game=pokemon&offset=40&limit=20"
        );
    }

    #[test]
    fn support_follows_configured_games() {
        let client = client().with_game_id(CardGameType::Magic, "mtg");
        assert!(client.supports(CardGameType::OnePiece));
        assert!(client.supports(CardGameType::Magic));
        assert!(!client.supports(CardGameType::Lorcana));
        assert!(!client.supports_delta(CardGameType::Pokemon));
        assert!(client.with_delta(true).supports_delta(CardGameType::Pokemon));
    }

    #[tokio::test]
    async fn unsupported_game_fails_without_a_request() {
        let err = client()
            .fetch_page(CardGameType::Digimon, Cursor::START, 20)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(CardGameType::Digimon)));
    }

    #[test]
    fn response_falls_back_to_cards_field() {
        let response: CardsResponse =
            serde_json::from_str(r#"{"cards":[{"name":"Luffy"}],"hasMore":true}"#).unwrap();
        let (cards, has_more) = response.into_cards();
        assert!(has_more);
        assert_eq!(cards.len(), 1);
    }

    #[test]
    fn missing_has_more_pages_until_empty() {
        let full: CardsResponse =
            serde_json::from_str(r#"{"data":[{"name":"Pikachu"},{"name":"Raichu"}]}"#).unwrap();
        let (cards, has_more) = full.into_cards();
        assert_eq!(cards.len(), 2);
        assert!(has_more);

        let empty: CardsResponse = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(!empty.into_cards().1);

        let explicit: CardsResponse =
            serde_json::from_str(r#"{"data":[{"name":"Mew"}],"hasMore":false}"#).unwrap();
        assert!(!explicit.into_cards().1);
    }
}
