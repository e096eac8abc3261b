//! Per-batch import statistics.
//!
//! The pipeline only writes here. Every call is synchronous and infallible so a
//! broken sink can never stall or fail an import.

use std::collections::BTreeMap;
use std::sync::Mutex;

use cardsync_core::{CardGameType, TypeRunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::orchestrator::TypeCounts;

pub const MAX_REASON_LEN: usize = 500;

pub trait StatsSink: Send + Sync {
    /// Called once at the start of every cycle.
    fn reset_batch(&self) {}

    fn record_start(&self, game: CardGameType);

    fn record_success(&self, game: CardGameType, counts: &TypeCounts);

    fn record_failure(&self, game: CardGameType, reason: &str, counts: &TypeCounts);

    fn record_not_attempted(&self, game: CardGameType);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRunStats {
    pub game: CardGameType,
    pub status: TypeRunStatus,
    pub counts: TypeCounts,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TypeRunStats {
    fn new(game: CardGameType, status: TypeRunStatus) -> Self {
        Self {
            game,
            status,
            counts: TypeCounts::default(),
            reason: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    NoImports,
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    batch: Mutex<Batch>,
}

#[derive(Debug, Default)]
struct Batch {
    started_at: Option<DateTime<Utc>>,
    types: BTreeMap<CardGameType, TypeRunStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_batch<R>(&self, f: impl FnOnce(&mut Batch) -> R) -> R {
        let mut guard = self.batch.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn update(&self, game: CardGameType, f: impl FnOnce(&mut TypeRunStats)) {
        self.with_batch(|batch| {
            let entry = batch
                .types
                .entry(game)
                .or_insert_with(|| TypeRunStats::new(game, TypeRunStatus::InProgress));
            f(entry);
        });
    }

    pub fn snapshot(&self) -> Vec<TypeRunStats> {
        self.with_batch(|batch| batch.types.values().cloned().collect())
    }

    pub fn batch_started_at(&self) -> Option<DateTime<Utc>> {
        self.with_batch(|batch| batch.started_at)
    }

    /// True once every attempted type reached a terminal status.
    pub fn is_batch_complete(&self) -> bool {
        self.with_batch(|batch| {
            batch
                .types
                .values()
                .all(|s| s.status != TypeRunStatus::InProgress)
        })
    }

    /// Types that were never attempted do not count either way.
    pub fn overall_status(&self) -> OverallStatus {
        let stats = self.snapshot();
        let succeeded = stats
            .iter()
            .filter(|s| s.status == TypeRunStatus::Success)
            .count();
        let failed = stats
            .iter()
            .filter(|s| s.status == TypeRunStatus::Failed)
            .count();

        match (succeeded, failed) {
            (0, 0) => OverallStatus::NoImports,
            (_, 0) => OverallStatus::Success,
            (0, _) => OverallStatus::Failed,
            _ => OverallStatus::PartialSuccess,
        }
    }
}

impl StatsSink for StatsCollector {
    fn reset_batch(&self) {
        self.with_batch(|batch| {
            batch.types.clear();
            batch.started_at = Some(Utc::now());
        });
        debug!("stats batch reset");
    }

    fn record_start(&self, game: CardGameType) {
        self.with_batch(|batch| {
            let mut stats = TypeRunStats::new(game, TypeRunStatus::InProgress);
            stats.started_at = Some(Utc::now());
            batch.types.insert(game, stats);
        });
    }

    fn record_success(&self, game: CardGameType, counts: &TypeCounts) {
        self.update(game, |stats| {
            stats.status = TypeRunStatus::Success;
            stats.counts = *counts;
            stats.finished_at = Some(Utc::now());
        });
        info!(
            %game,
            attempted = counts.attempted,
            imported = counts.imported,
            failed = counts.failed,
            "import succeeded"
        );
    }

    fn record_failure(&self, game: CardGameType, reason: &str, counts: &TypeCounts) {
        let reason = sanitize_reason(reason);
        self.update(game, |stats| {
            stats.status = TypeRunStatus::Failed;
            stats.counts = *counts;
            stats.reason = Some(reason.clone());
            stats.finished_at = Some(Utc::now());
        });
        info!(%game, %reason, imported = counts.imported, "import failed");
    }

    fn record_not_attempted(&self, game: CardGameType) {
        self.with_batch(|batch| {
            batch
                .types
                .insert(game, TypeRunStats::new(game, TypeRunStatus::NotAttempted));
        });
    }
}

/// Strips control characters (keeping line breaks and tabs) and angle
/// brackets, then caps the message at [`MAX_REASON_LEN`] characters.
pub fn sanitize_reason(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\r' | '\n' | '\t'))
        .filter(|c| !matches!(c, '<' | '>'))
        .collect();

    if cleaned.chars().count() > MAX_REASON_LEN {
        let head: String = cleaned.chars().take(MAX_REASON_LEN - 3).collect();
        format!("{head}...")
    } else {
        cleaned
    }
}
