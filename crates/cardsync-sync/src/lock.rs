use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cardsync_storage::LockStore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Gates both the nightly trigger and manual triggers.
pub const IMPORT_LOCK_NAME: &str = "card-import-cycle";

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// `<host>-<pid>-<short uuid>`, unique per process start.
pub fn instance_holder_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &nonce[..8])
}

#[derive(Clone)]
pub struct SchedulerLock {
    store: Arc<dyn LockStore>,
    holder_id: String,
    ttl: Duration,
}

impl SchedulerLock {
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self {
            store,
            holder_id: instance_holder_id(),
            ttl,
        }
    }

    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Never waits. A store error counts as "not acquired".
    pub async fn acquire(&self, name: &str) -> bool {
        match self.store.try_acquire(name, &self.holder_id, self.ttl).await {
            Ok(true) => {
                info!(
                    lock = name,
                    holder = %self.holder_id,
                    ttl_secs = self.ttl.as_secs(),
                    "lock acquired"
                );
                true
            }
            Ok(false) => {
                debug!(lock = name, holder = %self.holder_id, "lock held elsewhere");
                false
            }
            Err(err) => {
                error!(lock = name, error = %err, "lock acquire failed");
                false
            }
        }
    }

    /// Pushes our lock's expiry out by another TTL. False when the lock is gone,
    /// owned by someone else, or the store failed.
    pub async fn renew(&self, name: &str) -> bool {
        match self.store.extend(name, &self.holder_id, self.ttl).await {
            Ok(true) => {
                debug!(lock = name, holder = %self.holder_id, "lock renewed");
                true
            }
            Ok(false) => {
                warn!(lock = name, holder = %self.holder_id, "lock no longer ours");
                false
            }
            Err(err) => {
                error!(lock = name, error = %err, "lock renewal failed");
                false
            }
        }
    }

    /// Renews `name` every third of the TTL until the returned lease is dropped.
    pub fn keep_alive(&self, name: &str) -> Lease {
        let lost = Arc::new(AtomicBool::new(false));
        let period = (self.ttl / 3).max(Duration::from_millis(10));
        let heartbeat = {
            let lock = self.clone();
            let name = name.to_string();
            let lost = lost.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if !lock.renew(&name).await {
                        lost.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            })
        };
        Lease {
            lock: self.clone(),
            name: name.to_string(),
            lost,
            heartbeat,
        }
    }

    pub async fn release(&self, name: &str) -> bool {
        match self.store.release(name, &self.holder_id).await {
            Ok(released) => {
                debug!(lock = name, released, "lock release");
                released
            }
            Err(err) => {
                error!(
                    lock = name,
                    error = %err,
                    "lock release failed; it will expire on its own"
                );
                false
            }
        }
    }

    pub async fn purge_expired(&self) -> u64 {
        match self.store.purge_expired().await {
            Ok(0) => 0,
            Ok(purged) => {
                info!(purged, "expired scheduler locks removed");
                purged
            }
            Err(err) => {
                error!(error = %err, "expired lock cleanup failed");
                0
            }
        }
    }
}

/// A held lock kept alive in the background. Once lost it stays lost.
pub struct Lease {
    lock: SchedulerLock,
    name: String,
    lost: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
}

impl Lease {
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Renews right now; a failure marks the lease lost.
    pub async fn confirm(&self) -> bool {
        if self.is_lost() {
            return false;
        }
        if self.lock.renew(&self.name).await {
            true
        } else {
            self.lost.store(true, Ordering::SeqCst);
            false
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}
