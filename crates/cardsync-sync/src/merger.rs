//! Record merger: expansion tag extraction, expansion resolution and the
//! insert-vs-update decision against the catalog.

use std::collections::HashMap;
use std::sync::Arc;

use cardsync_core::{CandidateRecord, CardGameType, CatalogRecord, Expansion, NaturalKey};
use cardsync_storage::{CatalogStore, StoreError};
use thiserror::Error;
use tracing::{debug, info};

const TAG_OPEN: &str = "[Expansion:";

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("candidate has an empty name")]
    EmptyName,
    #[error("catalog lookup failed for {key}: {source}")]
    Lookup {
        key: NaturalKey,
        #[source]
        source: StoreError,
    },
    #[error("could not resolve expansion '{title}': {source}")]
    Expansion {
        title: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord {
    pub record: CatalogRecord,
    pub action: MergeAction,
}

/// Splits an `[Expansion: <name>]` tag out of a description.
///
/// Returns the description with the tag removed and the trimmed expansion
/// name. A missing tag, an unterminated tag or an empty name leaves the
/// description as it was.
pub fn extract_expansion_tag(description: &str) -> (String, Option<String>) {
    let Some(start) = description.find(TAG_OPEN) else {
        return (description.to_string(), None);
    };
    let inner_start = start + TAG_OPEN.len();
    let Some(close) = description[inner_start..].find(']') else {
        return (description.to_string(), None);
    };
    let name = description[inner_start..inner_start + close].trim();
    if name.is_empty() {
        return (description.to_string(), None);
    }

    let before = description[..start].trim_end();
    let after = description[inner_start + close + 1..].trim();
    let stripped = match (before.is_empty(), after.is_empty()) {
        (_, true) => before.to_string(),
        (true, false) => after.to_string(),
        (false, false) => format!("{before} {after}"),
    };
    (stripped.trim().to_string(), Some(name.to_string()))
}

/// One merger lives for one type run; its expansion cache is not shared.
pub struct RecordMerger {
    store: Arc<dyn CatalogStore>,
    expansions: HashMap<(CardGameType, String), Expansion>,
}

impl RecordMerger {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            expansions: HashMap::new(),
        }
    }

    /// Decides what to persist for `candidate`. Never writes catalog records;
    /// the only write is a possible expansion creation.
    pub async fn merge(
        &mut self,
        mut candidate: CandidateRecord,
    ) -> Result<MergedRecord, MergeError> {
        candidate.name = candidate.name.trim().to_string();
        if candidate.name.is_empty() {
            return Err(MergeError::EmptyName);
        }

        let mut expansion = None;
        if let Some(description) = candidate.description.take() {
            let (stripped, title) = extract_expansion_tag(&description);
            candidate.description = Some(stripped).filter(|d| !d.is_empty());
            if let Some(title) = title {
                expansion = Some(self.resolve_expansion(title, candidate.game).await?);
            }
        }

        let key = candidate.natural_key();
        let existing = self
            .store
            .find_by_natural_key(&key)
            .await
            .map_err(|source| MergeError::Lookup {
                key: key.clone(),
                source,
            })?;

        match existing {
            Some(mut record) => {
                record.image_url = candidate.image_url;
                record.description = candidate.description;
                debug!(%key, "merging into existing record");
                Ok(MergedRecord {
                    record,
                    action: MergeAction::Update,
                })
            }
            None => Ok(MergedRecord {
                record: CatalogRecord::from_candidate(candidate, expansion.as_ref()),
                action: MergeAction::Insert,
            }),
        }
    }

    async fn resolve_expansion(
        &mut self,
        title: String,
        game: CardGameType,
    ) -> Result<Expansion, MergeError> {
        let cache_key = (game, title);
        if let Some(expansion) = self.expansions.get(&cache_key) {
            return Ok(expansion.clone());
        }
        let title = &cache_key.1;
        let to_error = |source| MergeError::Expansion {
            title: title.clone(),
            source,
        };

        let expansion = match self.store.find_expansion(title, game).await.map_err(to_error)? {
            Some(found) => found,
            None => {
                let created = self
                    .store
                    .create_expansion(Expansion::new(title.clone(), game))
                    .await
                    .map_err(to_error)?;
                info!(%game, expansion = %created.title, "created expansion");
                created
            }
        };

        self.expansions.insert(cache_key, expansion.clone());
        Ok(expansion)
    }
}
