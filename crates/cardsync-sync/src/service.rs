//! Trigger surface: manual and timer-driven import cycles behind one lock.

use std::sync::Arc;

use anyhow::{Context, Result};
use cardsync_adapters::{build_registry, load_providers_file, ProviderRegistry};
use cardsync_core::{CardGameType, ImportMode, ImportProgress};
use cardsync_storage::{
    postgres, CatalogStore, HttpClientConfig, HttpFetcher, LockStore, MemoryCatalogStore,
    MemoryLockStore, MemoryProgressStore, PgCatalogStore, PgLockStore, PgProgressStore,
    ProgressStore,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{StoreBackend, SyncConfig};
use crate::coordinator::{CycleSummary, ModePolicy, RunCoordinator};
use crate::lock::{SchedulerLock, IMPORT_LOCK_NAME};
use crate::orchestrator::TypeOrchestrator;
use crate::reports::{write_run_report, RunReport};
use crate::stats::StatsCollector;

#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn CatalogStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub locks: Arc<dyn LockStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            catalog: Arc::new(MemoryCatalogStore::new()),
            progress: Arc::new(MemoryProgressStore::new()),
            locks: Arc::new(MemoryLockStore::new()),
        }
    }

    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        match config.store_backend {
            StoreBackend::Memory => Ok(Self::in_memory()),
            StoreBackend::Postgres => {
                let pool = postgres::connect(&config.database_url, 5)
                    .await
                    .context("connecting to postgres")?;
                Ok(Self {
                    catalog: Arc::new(PgCatalogStore::new(pool.clone())),
                    progress: Arc::new(PgProgressStore::new(pool.clone())),
                    locks: Arc::new(PgLockStore::new(pool)),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualTrigger {
    /// `None` runs every game.
    pub game: Option<CardGameType>,
    pub mode: ImportMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerAck {
    Started { run_id: Uuid },
    Skipped { reason: String },
}

#[derive(Clone)]
pub struct ImportService {
    coordinator: Arc<RunCoordinator>,
    lock: SchedulerLock,
    stats: Arc<StatsCollector>,
    progress: Arc<dyn ProgressStore>,
    config: SyncConfig,
}

impl ImportService {
    pub fn new(
        config: SyncConfig,
        stores: Stores,
        registry: ProviderRegistry,
        stats: Arc<StatsCollector>,
    ) -> Self {
        let orchestrator = Arc::new(TypeOrchestrator::new(
            stores.catalog.clone(),
            stores.progress.clone(),
            stats.clone(),
            config.import_settings(),
        ));
        let coordinator = Arc::new(RunCoordinator::new(
            orchestrator,
            Arc::new(registry),
            stats.clone(),
            config.inter_type_delay,
        ));
        Self {
            coordinator,
            lock: SchedulerLock::new(stores.locks, config.lock_ttl),
            stats,
            progress: stores.progress,
            config,
        }
    }

    /// Wires stores, the HTTP fetcher and `providers.yaml` from configuration.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let stores = Stores::connect(&config).await?;
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: std::time::Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?);
        let providers = load_providers_file(config.providers_path())?;
        let registry = build_registry(&providers, &config.workspace_root, fetcher)?;
        Ok(Self::new(config, stores, registry, Arc::new(StatsCollector::new())))
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    pub fn registry(&self) -> &ProviderRegistry {
        self.coordinator.registry()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn progress(&self) -> Result<Vec<ImportProgress>> {
        self.progress.list().await.context("listing import progress")
    }

    /// Acquires the lock and starts the cycle in the background.
    pub async fn trigger_manual(&self, trigger: ManualTrigger) -> TriggerAck {
        if !self.lock.acquire(IMPORT_LOCK_NAME).await {
            return skipped();
        }
        let run_id = Uuid::new_v4();
        let service = self.clone();
        tokio::spawn(async move {
            let games = games_for(trigger.game);
            service
                .run_locked(run_id, "manual", &games, ModePolicy::Fixed(trigger.mode))
                .await;
        });
        info!(%run_id, game = ?trigger.game, mode = %trigger.mode, "manual import started");
        TriggerAck::Started { run_id }
    }

    /// Same as [`trigger_manual`](Self::trigger_manual) but waits for the cycle.
    /// Returns `None` when another cycle holds the lock.
    pub async fn run_manual(&self, trigger: ManualTrigger) -> Option<CycleSummary> {
        if !self.lock.acquire(IMPORT_LOCK_NAME).await {
            info!("import cycle already running; manual run skipped");
            return None;
        }
        let summary = self
            .run_locked(
                Uuid::new_v4(),
                "manual",
                &games_for(trigger.game),
                ModePolicy::Fixed(trigger.mode),
            )
            .await;
        Some(summary)
    }

    /// Timer trigger: every game, DELTA wherever the provider supports it.
    pub async fn run_scheduled(&self) -> Option<CycleSummary> {
        if !self.lock.acquire(IMPORT_LOCK_NAME).await {
            info!("import cycle already running; scheduled run skipped");
            return None;
        }
        let summary = self
            .run_locked(
                Uuid::new_v4(),
                "scheduled",
                &CardGameType::ALL,
                ModePolicy::PreferDelta,
            )
            .await;
        Some(summary)
    }

    pub async fn purge_expired_locks(&self) -> u64 {
        self.lock.purge_expired().await
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        trigger: &str,
        games: &[CardGameType],
        policy: ModePolicy,
    ) -> CycleSummary {
        let lease = self.lock.keep_alive(IMPORT_LOCK_NAME);
        let summary = self
            .coordinator
            .run_cycle_leased(run_id, games, policy, &lease)
            .await;

        let report = RunReport {
            trigger: trigger.to_string(),
            overall_status: self.stats.overall_status(),
            summary: summary.clone(),
            stats: self.stats.snapshot(),
        };
        match write_run_report(&self.config.reports_dir, &report).await {
            Ok(dir) => info!(%run_id, dir = %dir.display(), "run report written"),
            Err(err) => warn!(%run_id, error = %err, "could not write run report"),
        }

        drop(lease);
        if !self.lock.release(IMPORT_LOCK_NAME).await {
            warn!(%run_id, "lock was no longer ours at the end of the cycle");
        }
        summary
    }

    /// Nightly import plus hourly lock cleanup. `None` when the scheduler is disabled.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let service = Arc::clone(self);
        let import_job = Job::new_async(self.config.import_cron.as_str(), move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                if let Some(summary) = service.run_scheduled().await {
                    info!(
                        run_id = %summary.run_id,
                        failed = summary.failed,
                        "scheduled import done"
                    );
                }
            })
        })
        .with_context(|| format!("creating import job for cron {}", self.config.import_cron))?;
        sched.add(import_job).await.context("adding import job")?;

        let service = Arc::clone(self);
        let cleanup_job =
            Job::new_async(self.config.lock_cleanup_cron.as_str(), move |_uuid, _l| {
                let service = service.clone();
                Box::pin(async move {
                    service.purge_expired_locks().await;
                })
            })
            .with_context(|| {
                format!(
                    "creating lock cleanup job for cron {}",
                    self.config.lock_cleanup_cron
                )
            })?;
        sched.add(cleanup_job).await.context("adding lock cleanup job")?;

        info!(
            import_cron = %self.config.import_cron,
            cleanup_cron = %self.config.lock_cleanup_cron,
            "scheduler configured"
        );
        Ok(Some(sched))
    }
}

fn games_for(game: Option<CardGameType>) -> Vec<CardGameType> {
    match game {
        Some(game) => vec![game],
        None => CardGameType::ALL.to_vec(),
    }
}

fn skipped() -> TriggerAck {
    let reason = "another import cycle holds the lock".to_string();
    info!(%reason, "manual import skipped");
    TriggerAck::Skipped { reason }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cardsync_core::TypeRunStatus;

    use super::*;
    use crate::testing::{numbered, ScriptedProvider};

    fn config(reports_dir: &std::path::Path) -> SyncConfig {
        let mut config = SyncConfig::from_lookup(|_| None);
        config.store_backend = StoreBackend::Memory;
        config.inter_type_delay = Duration::ZERO;
        config.reports_dir = reports_dir.to_path_buf();
        config
    }

    fn service(reports_dir: &std::path::Path, stores: Stores) -> ImportService {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(
            ScriptedProvider::with_cards(CardGameType::Pokemon, numbered(3)).with_delta(),
        ));
        ImportService::new(
            config(reports_dir),
            stores,
            registry,
            Arc::new(StatsCollector::new()),
        )
    }

    #[tokio::test]
    async fn run_manual_imports_and_releases_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::in_memory();
        let service = service(tmp.path(), stores.clone());

        let summary = service
            .run_manual(ManualTrigger {
                game: Some(CardGameType::Pokemon),
                mode: ImportMode::Full,
            })
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.reports.len(), 1);
        assert!(stores.locks.current(IMPORT_LOCK_NAME).await.unwrap().is_none());
        assert!(tmp
            .path()
            .join(summary.run_id.to_string())
            .join(crate::reports::SUMMARY_FILE)
            .exists());
    }

    #[tokio::test]
    async fn held_lock_skips_every_trigger() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::in_memory();
        stores
            .locks
            .try_acquire(IMPORT_LOCK_NAME, "other-node", Duration::from_secs(60))
            .await
            .unwrap();
        let service = service(tmp.path(), stores.clone());

        let ack = service
            .trigger_manual(ManualTrigger {
                game: None,
                mode: ImportMode::Delta,
            })
            .await;
        assert!(matches!(ack, TriggerAck::Skipped { .. }));
        assert!(service.run_scheduled().await.is_none());
        assert_eq!(
            stores.locks.current(IMPORT_LOCK_NAME).await.unwrap().unwrap().holder_id,
            "other-node"
        );
    }

    #[tokio::test]
    async fn scheduled_run_prefers_delta_and_visits_all_games() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service(tmp.path(), Stores::in_memory());

        let summary = service.run_scheduled().await.unwrap();
        assert_eq!(summary.reports.len(), CardGameType::ALL.len());
        let pokemon = summary.report_for(CardGameType::Pokemon).unwrap();
        assert_eq!(pokemon.mode, ImportMode::Delta);
        assert_eq!(pokemon.status, TypeRunStatus::Success);
        assert_eq!(summary.skipped, CardGameType::ALL.len() - 1);
        assert_eq!(service.progress().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trigger_manual_acknowledges_then_runs_in_background() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::in_memory();
        let service = service(tmp.path(), stores.clone());

        let ack = service
            .trigger_manual(ManualTrigger {
                game: Some(CardGameType::Pokemon),
                mode: ImportMode::Full,
            })
            .await;
        let TriggerAck::Started { run_id } = ack else {
            panic!("expected the run to start");
        };

        let summary_path = tmp
            .path()
            .join(run_id.to_string())
            .join(crate::reports::SUMMARY_FILE);
        for _ in 0..200 {
            if summary_path.exists()
                && stores.locks.current(IMPORT_LOCK_NAME).await.unwrap().is_none()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(summary_path.exists());
        assert_eq!(stores.catalog.count_records(CardGameType::Pokemon).await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lock_is_renewed_while_a_long_cycle_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.lock_ttl = Duration::from_millis(200);
        config.page_size = 1;
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(
            ScriptedProvider::with_cards(CardGameType::Pokemon, numbered(10))
                .with_page_delay(Duration::from_millis(60)),
        ));
        let service = ImportService::new(
            config,
            Stores::in_memory(),
            registry,
            Arc::new(StatsCollector::new()),
        );

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.run_scheduled().await })
        };
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(service.run_scheduled().await.is_none());

        let summary = first.await.unwrap().unwrap();
        assert!(!summary.lease_lost);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.imported, 10);
        assert!(service.run_scheduled().await.is_some());
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let service = Arc::new(service(tmp.path(), Stores::in_memory()));
        assert!(service.build_scheduler().await.unwrap().is_none());
    }
}
