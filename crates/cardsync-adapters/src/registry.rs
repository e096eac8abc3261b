//! Capability map from card game to provider, loaded from `providers.yaml`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cardsync_core::CardGameType;
use cardsync_storage::HttpFetcher;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{FixtureProvider, HttpCardApiClient, ProviderClient};

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersFile {
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Http,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub kind: ProviderKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub games: Vec<CardGameType>,
    #[serde(default)]
    pub delta: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub fixtures_dir: Option<PathBuf>,
    /// Per-game overrides of the upstream game identifier.
    #[serde(default)]
    pub game_ids: BTreeMap<CardGameType, String>,
}

fn default_enabled() -> bool {
    true
}

pub fn load_providers_file(path: impl AsRef<Path>) -> Result<ProvidersFile> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Builds the registry from enabled providers. Relative fixture dirs resolve
/// against `workspace_root`. The first provider listing a game owns it.
pub fn build_registry(
    file: &ProvidersFile,
    workspace_root: &Path,
    fetcher: Arc<HttpFetcher>,
) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    for config in file.providers.iter().filter(|p| p.enabled) {
        let client: Arc<dyn ProviderClient> = match config.kind {
            ProviderKind::Http => {
                let Some(base_url) = &config.base_url else {
                    bail!("provider '{}' is http but has no base_url", config.provider_id);
                };
                let api_key = config.api_key_env.as_ref().and_then(|var| {
                    let key = std::env::var(var).ok().filter(|v| !v.is_empty());
                    if key.is_none() {
                        warn!(
                            provider_id = %config.provider_id,
                            env = %var,
                            "api key env var not set"
                        );
                    }
                    key
                });
                let mut client = HttpCardApiClient::new(
                    config.provider_id.clone(),
                    base_url.clone(),
                    api_key,
                    &config.games,
                    fetcher.clone(),
                )
                .with_delta(config.delta);
                for (game, game_id) in &config.game_ids {
                    client = client.with_game_id(*game, game_id.clone());
                }
                Arc::new(client)
            }
            ProviderKind::Fixture => {
                let dir = config
                    .fixtures_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("fixtures").join(&config.provider_id));
                let dir = if dir.is_relative() {
                    workspace_root.join(dir)
                } else {
                    dir
                };
                Arc::new(
                    FixtureProvider::new(config.provider_id.clone(), dir, &config.games)
                        .with_delta(config.delta),
                )
            }
        };
        registry.register(client);
    }

    info!(games = ?registry.supported_games(), "provider registry built");
    Ok(registry)
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_game: BTreeMap<CardGameType, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client` for every game it supports that has no provider yet.
    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        for game in CardGameType::ALL {
            if client.supports(game) && !self.by_game.contains_key(&game) {
                self.by_game.insert(game, client.clone());
            }
        }
    }

    pub fn provider_for(&self, game: CardGameType) -> Option<Arc<dyn ProviderClient>> {
        self.by_game.get(&game).cloned()
    }

    pub fn supports(&self, game: CardGameType) -> bool {
        self.by_game.contains_key(&game)
    }

    pub fn supports_delta(&self, game: CardGameType) -> bool {
        self.by_game
            .get(&game)
            .is_some_and(|client| client.supports_delta(game))
    }

    pub fn supported_games(&self) -> Vec<CardGameType> {
        self.by_game.keys().copied().collect()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.by_game
                    .iter()
                    .map(|(game, client)| (game.slug(), client.provider_id())),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use cardsync_storage::HttpClientConfig;

    use super::*;

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
    }

    const YAML: &str = r#"
providers:
  - provider_id: card-api
    kind: http
    games: [pokemon, one_piece, magic]
    delta: true
    base_url: https://api.example.test/v1
    api_key_env: CARDSYNC_TEST_UNSET_KEY
    game_ids:
      magic: mtg
  - provider_id: local
    kind: fixture
    games: [magic, lorcana]
    fixtures_dir: fixtures/local
  - provider_id: retired
    kind: fixture
    enabled: false
    games: [digimon]
"#;

    #[test]
    fn first_enabled_provider_owns_each_game() {
        let file: ProvidersFile = serde_yaml::from_str(YAML).unwrap();
        let registry = build_registry(&file, Path::new("/srv/cardsync"), fetcher()).unwrap();

        assert_eq!(
            registry.supported_games(),
            vec![
                CardGameType::Pokemon,
                CardGameType::OnePiece,
                CardGameType::Magic,
                CardGameType::Lorcana
            ]
        );
        let magic = registry.provider_for(CardGameType::Magic).unwrap();
        assert_eq!(magic.provider_id(), "card-api");
        assert!(registry.supports_delta(CardGameType::Pokemon));
        assert!(!registry.supports_delta(CardGameType::Lorcana));
        assert!(!registry.supports(CardGameType::Digimon));
    }

    #[test]
    fn http_provider_without_base_url_is_rejected() {
        let file: ProvidersFile = serde_yaml::from_str(
            "providers:\n  - provider_id: broken\n    kind: http\n    games: [pokemon]\n",
        )
        .unwrap();
        let err = build_registry(&file, Path::new("."), fetcher()).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn loads_providers_file_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("providers.yaml");
        std::fs::write(&path, YAML).unwrap();
        let file = load_providers_file(&path).unwrap();
        assert_eq!(file.providers.len(), 3);
        assert_eq!(file.providers[1].kind, ProviderKind::Fixture);
        assert!(!file.providers[2].enabled);
    }
}
