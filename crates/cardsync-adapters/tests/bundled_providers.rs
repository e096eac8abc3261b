use std::path::PathBuf;
use std::sync::Arc;

use cardsync_adapters::{build_registry, load_providers_file, ProviderClient};
use cardsync_core::{CardGameType, Cursor};
use cardsync_storage::{HttpClientConfig, HttpFetcher};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn bundled_registry_serves_local_fixtures() {
    let root = workspace_root();
    let file = load_providers_file(root.join("providers.yaml")).expect("providers.yaml parses");
    let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let registry = build_registry(&file, &root, fetcher).expect("registry builds");

    assert_eq!(
        registry.supported_games(),
        vec![CardGameType::Pokemon, CardGameType::Lorcana]
    );
    assert!(registry.supports_delta(CardGameType::Pokemon));
    assert!(!registry.supports(CardGameType::Magic));

    let pokemon = registry.provider_for(CardGameType::Pokemon).unwrap();
    let page = pokemon
        .fetch_page(CardGameType::Pokemon, Cursor::START, 50)
        .await
        .unwrap();
    // The blank-named entry is dropped but still advances the cursor.
    assert_eq!(page.records.len(), 4);
    assert_eq!(page.next_cursor, Cursor(5));
    assert!(!page.has_more);
    assert!(page
        .records
        .iter()
        .all(|c| c.description.as_deref().is_some_and(|d| d.contains("[Expansion: "))));

    let lorcana = registry.provider_for(CardGameType::Lorcana).unwrap();
    let first = lorcana
        .fetch_delta(CardGameType::Lorcana, Cursor(1), 1)
        .await
        .unwrap();
    assert_eq!(first.records[0].name, "Ariel - Spectacular Singer");
    assert_eq!(first.records[0].mana_cost, Some(3));
    assert!(first.has_more);
}
