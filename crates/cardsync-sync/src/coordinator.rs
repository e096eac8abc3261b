//! One import cycle over every card game, in order.

use std::sync::Arc;
use std::time::Duration;

use cardsync_adapters::ProviderRegistry;
use cardsync_core::{CardGameType, ImportMode, TypeRunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::lock::Lease;
use crate::orchestrator::{ImportError, TypeCounts, TypeOrchestrator, TypeRunReport};
use crate::stats::StatsSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModePolicy {
    Fixed(ImportMode),
    /// DELTA where the provider supports it, otherwise FULL.
    PreferDelta,
}

impl ModePolicy {
    pub fn mode_for(&self, game: CardGameType, registry: &ProviderRegistry) -> ImportMode {
        match self {
            ModePolicy::Fixed(mode) => *mode,
            ModePolicy::PreferDelta if registry.supports_delta(game) => ImportMode::Delta,
            ModePolicy::PreferDelta => ImportMode::Full,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub imported: u64,
    /// The cycle stopped early because its lock could not be renewed.
    #[serde(default)]
    pub lease_lost: bool,
    pub reports: Vec<TypeRunReport>,
}

impl CycleSummary {
    pub fn report_for(&self, game: CardGameType) -> Option<&TypeRunReport> {
        self.reports.iter().find(|r| r.game == game)
    }
}

pub struct RunCoordinator {
    orchestrator: Arc<TypeOrchestrator>,
    registry: Arc<ProviderRegistry>,
    stats: Arc<dyn StatsSink>,
    inter_type_delay: Duration,
}

impl RunCoordinator {
    pub fn new(
        orchestrator: Arc<TypeOrchestrator>,
        registry: Arc<ProviderRegistry>,
        stats: Arc<dyn StatsSink>,
        inter_type_delay: Duration,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            stats,
            inter_type_delay,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Visits every game in `games`. A failing game never stops the cycle.
    pub async fn run_cycle(
        &self,
        run_id: Uuid,
        games: &[CardGameType],
        policy: ModePolicy,
    ) -> CycleSummary {
        self.cycle(run_id, games, policy, None).await
    }

    /// Like [`run_cycle`](Self::run_cycle), but confirms `lease` before each
    /// game. Once the lease is lost the remaining games are not attempted.
    pub async fn run_cycle_leased(
        &self,
        run_id: Uuid,
        games: &[CardGameType],
        policy: ModePolicy,
        lease: &Lease,
    ) -> CycleSummary {
        self.cycle(run_id, games, policy, Some(lease)).await
    }

    async fn cycle(
        &self,
        run_id: Uuid,
        games: &[CardGameType],
        policy: ModePolicy,
        lease: Option<&Lease>,
    ) -> CycleSummary {
        let started_at = Utc::now();
        self.stats.reset_batch();
        info!(%run_id, games = games.len(), ?policy, "import cycle started");

        let mut reports = Vec::with_capacity(games.len());
        let mut attempted_any = false;
        let mut lease_lost = false;

        for &game in games {
            let mode = policy.mode_for(game, &self.registry);
            let provider = match self.registry.provider_for(game) {
                Some(provider) if !lease_lost => provider,
                _ => {
                    if !lease_lost {
                        info!(%run_id, %game, "no provider registered; not attempted");
                    }
                    self.stats.record_not_attempted(game);
                    reports.push(TypeRunReport::not_attempted(game, mode));
                    continue;
                }
            };

            if attempted_any && !self.inter_type_delay.is_zero() {
                tokio::time::sleep(self.inter_type_delay).await;
            }
            if let Some(lease) = lease {
                if !lease.confirm().await {
                    warn!(%run_id, %game, "import lock lost; stopping the cycle");
                    lease_lost = true;
                    self.stats.record_not_attempted(game);
                    reports.push(TypeRunReport::not_attempted(game, mode));
                    continue;
                }
            }
            attempted_any = true;

            let orchestrator = self.orchestrator.clone();
            let type_started = Utc::now();
            let handle =
                tokio::spawn(async move { orchestrator.run(game, mode, Some(provider)).await });
            let report = match handle.await {
                Ok(report) => report,
                Err(join_err) => {
                    let err = ImportError::Aborted(join_err.to_string());
                    error!(%run_id, %game, error = %err, "import task did not complete");
                    self.stats
                        .record_failure(game, &err.to_string(), &TypeCounts::default());
                    TypeRunReport::failed(game, mode, err.to_string(), type_started)
                }
            };
            reports.push(report);
        }

        let mut summary = summarize(run_id, started_at, reports);
        summary.lease_lost = lease_lost;
        info!(
            %run_id,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            imported = summary.imported,
            lease_lost,
            "import cycle finished"
        );
        summary
    }
}

fn summarize(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    reports: Vec<TypeRunReport>,
) -> CycleSummary {
    let count = |status| reports.iter().filter(|r| r.status == status).count();
    let succeeded = count(TypeRunStatus::Success);
    let failed = count(TypeRunStatus::Failed);
    let skipped = count(TypeRunStatus::NotAttempted);
    let imported = reports.iter().map(|r| r.counts.imported).sum();

    CycleSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        attempted: succeeded + failed,
        succeeded,
        failed,
        skipped,
        imported,
        lease_lost: false,
        reports,
    }
}

#[cfg(test)]
mod tests {
    use cardsync_adapters::ProviderClient;
    use cardsync_core::Cursor;
    use cardsync_storage::{LockStore, MemoryCatalogStore, MemoryLockStore, MemoryProgressStore};

    use super::*;
    use crate::lock::{SchedulerLock, DEFAULT_LOCK_TTL, IMPORT_LOCK_NAME};
    use crate::orchestrator::ImportSettings;
    use crate::stats::{OverallStatus, StatsCollector};
    use crate::testing::{numbered, ScriptedProvider};

    fn coordinator(registry: ProviderRegistry, stats: Arc<StatsCollector>) -> RunCoordinator {
        let orchestrator = Arc::new(TypeOrchestrator::new(
            Arc::new(MemoryCatalogStore::new()),
            Arc::new(MemoryProgressStore::new()),
            stats.clone(),
            ImportSettings {
                chunk_size: 2,
                page_size: 5,
                max_pages: None,
                type_timeout: Duration::from_secs(5),
            },
        ));
        RunCoordinator::new(orchestrator, Arc::new(registry), stats, Duration::ZERO)
    }

    #[tokio::test]
    async fn failing_middle_type_does_not_stop_neighbours() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::with_cards(
            CardGameType::Pokemon,
            numbered(3),
        )));
        registry.register(Arc::new(
            ScriptedProvider::with_cards(CardGameType::OnePiece, numbered(3))
                .failing_at(Cursor::START),
        ));
        registry.register(Arc::new(ScriptedProvider::with_cards(
            CardGameType::Magic,
            numbered(2),
        )));
        let stats = Arc::new(StatsCollector::new());

        let summary = coordinator(registry, stats.clone())
            .run_cycle(Uuid::new_v4(), &CardGameType::ALL, ModePolicy::Fixed(ImportMode::Full))
            .await;

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.imported, 5);
        assert_eq!(
            summary.report_for(CardGameType::OnePiece).unwrap().status,
            TypeRunStatus::Failed
        );
        assert_eq!(stats.overall_status(), OverallStatus::PartialSuccess);

        let recorded: Vec<_> = stats
            .snapshot()
            .into_iter()
            .map(|s| (s.game, s.status))
            .collect();
        assert!(recorded.contains(&(CardGameType::Pokemon, TypeRunStatus::Success)));
        assert!(recorded.contains(&(CardGameType::OnePiece, TypeRunStatus::Failed)));
        assert!(recorded.contains(&(CardGameType::Magic, TypeRunStatus::Success)));
    }

    #[tokio::test]
    async fn panicking_provider_is_contained() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(
            ScriptedProvider::with_cards(CardGameType::Pokemon, numbered(1)).panicking(),
        ));
        registry.register(Arc::new(ScriptedProvider::with_cards(
            CardGameType::Lorcana,
            numbered(1),
        )));
        let stats = Arc::new(StatsCollector::new());

        let summary = coordinator(registry, stats)
            .run_cycle(
                Uuid::new_v4(),
                &[CardGameType::Pokemon, CardGameType::Lorcana],
                ModePolicy::PreferDelta,
            )
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        let pokemon = summary.report_for(CardGameType::Pokemon).unwrap();
        assert!(pokemon.reason.as_deref().unwrap().contains("aborted"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempted_types_only() {
        let mut registry = ProviderRegistry::new();
        for game in [CardGameType::Pokemon, CardGameType::Magic] {
            registry.register(Arc::new(ScriptedProvider::with_cards(game, numbered(1))));
        }
        let stats = Arc::new(StatsCollector::new());
        let mut coordinator = coordinator(registry, stats);
        coordinator.inter_type_delay = Duration::from_secs(5);

        let started = tokio::time::Instant::now();
        coordinator
            .run_cycle(Uuid::new_v4(), &CardGameType::ALL, ModePolicy::Fixed(ImportMode::Full))
            .await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn lost_lease_stops_before_the_next_game() {
        let mut registry = ProviderRegistry::new();
        for game in [CardGameType::Pokemon, CardGameType::Magic] {
            registry.register(Arc::new(ScriptedProvider::with_cards(game, numbered(1))));
        }
        let stats = Arc::new(StatsCollector::new());
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let owner = SchedulerLock::new(store.clone(), DEFAULT_LOCK_TTL).with_holder_id("owner");
        assert!(owner.acquire(IMPORT_LOCK_NAME).await);
        let lease = SchedulerLock::new(store, DEFAULT_LOCK_TTL)
            .with_holder_id("stale")
            .keep_alive(IMPORT_LOCK_NAME);

        let summary = coordinator(registry, stats)
            .run_cycle_leased(
                Uuid::new_v4(),
                &CardGameType::ALL,
                ModePolicy::Fixed(ImportMode::Full),
                &lease,
            )
            .await;

        assert!(summary.lease_lost);
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.skipped, CardGameType::ALL.len());
        assert_eq!(summary.imported, 0);
    }

    #[test]
    fn prefer_delta_uses_provider_capability() {
        let mut registry = ProviderRegistry::new();
        let delta: Arc<dyn ProviderClient> = Arc::new(
            ScriptedProvider::with_cards(CardGameType::Pokemon, Vec::new()).with_delta(),
        );
        registry.register(delta);
        registry.register(Arc::new(ScriptedProvider::with_cards(
            CardGameType::Magic,
            Vec::new(),
        )));

        assert_eq!(
            ModePolicy::PreferDelta.mode_for(CardGameType::Pokemon, &registry),
            ImportMode::Delta
        );
        assert_eq!(
            ModePolicy::PreferDelta.mode_for(CardGameType::Magic, &registry),
            ImportMode::Full
        );
        assert_eq!(
            ModePolicy::Fixed(ImportMode::Full).mode_for(CardGameType::Pokemon, &registry),
            ImportMode::Full
        );
    }
}
