//! Card catalog import pipeline: read provider pages, merge against the
//! catalog, write in chunks, advance per-game progress.
//!
//! [`ImportService`] is the entry point for both manual and scheduled runs.
//! Everything below it works against the store traits in `cardsync-storage`.

pub mod config;
pub mod coordinator;
pub mod lock;
pub mod merger;
pub mod orchestrator;
pub mod reader;
pub mod reports;
pub mod service;
pub mod stats;
pub mod writer;

#[cfg(test)]
mod testing;

pub use config::{StoreBackend, SyncConfig};
pub use coordinator::{CycleSummary, ModePolicy, RunCoordinator};
pub use lock::{instance_holder_id, Lease, SchedulerLock, DEFAULT_LOCK_TTL, IMPORT_LOCK_NAME};
pub use merger::{extract_expansion_tag, MergeAction, MergeError, MergedRecord, RecordMerger};
pub use orchestrator::{
    ImportError, ImportSettings, ImportState, TypeCounts, TypeOrchestrator, TypeRunReport,
};
pub use reader::{ReadTermination, ReaderSettings, SourceReader};
pub use reports::{report_recent_runs, write_run_report, RunReport};
pub use service::{ImportService, ManualTrigger, Stores, TriggerAck};
pub use stats::{sanitize_reason, OverallStatus, StatsCollector, StatsSink, TypeRunStats};
pub use writer::{ChunkedWriter, WriteBatchError, DEFAULT_CHUNK_SIZE};

pub const CRATE_NAME: &str = "cardsync-sync";
