//! Persistence Scheduler
//!
//! Periodic single-flight flush of the catalog and every table's artifacts.
//! State machine per tick:
//!
//! ```text
//! IDLE --tick--> ELIGIBLE
//! ELIGIBLE --(offline OR running)--> IDLE
//! ELIGIBLE --else--> RUNNING          [running = true]
//! RUNNING --success--> IDLE           [running = false, ok++]
//! RUNNING --error--> IDLE             [running = false, err++, last_error = now]
//! ```
//!
//! `running` is a process-local atomic: at most one pass is in flight per
//! node, and a rejected pass returns `false` without touching disk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::catalog::Catalog;
use crate::cluster::node::{now_ms, Membership};
use crate::config::PersistenceConfig;
use crate::metrics::Metrics;

/// Health counters exposed over `/metrics` and `/health`.
#[derive(Debug, Clone, Default)]
pub struct PersistenceHealth {
    pub passes_ok: u64,
    pub error_count: u64,
    pub last_error_ms: Option<u64>,
    /// `(database, duration)` of the most recent successful pass.
    pub last_pass_durations: Vec<(String, Duration)>,
}

pub struct PersistenceScheduler {
    catalog: Arc<Catalog>,
    membership: Arc<Membership>,
    metrics: Arc<Metrics>,
    config: PersistenceConfig,
    running: AtomicBool,
    health: Mutex<PersistenceHealth>,
}

impl PersistenceScheduler {
    pub fn new(
        catalog: Arc<Catalog>,
        membership: Arc<Membership>,
        metrics: Arc<Metrics>,
        config: PersistenceConfig,
    ) -> PersistenceScheduler {
        PersistenceScheduler {
            catalog,
            membership,
            metrics,
            config,
            running: AtomicBool::new(false),
            health: Mutex::new(PersistenceHealth::default()),
        }
    }

    /// Tick loop; exits on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let scheduler = self.clone();
                    // Disk work stays off the async workers.
                    let _ = tokio::task::spawn_blocking(move || {
                        scheduler.perform_persist_to_disk()
                    })
                    .await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("persistence scheduler stopping; final pass");
                        self.perform_persist_to_disk();
                        return;
                    }
                }
            }
        }
    }

    /// One eligibility-checked pass. Returns `true` iff the full pass
    /// completed without errors.
    pub fn perform_persist_to_disk(&self) -> bool {
        if !self.membership.is_online() {
            debug!("skipping persistence pass: node offline");
            return false;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("skipping persistence pass: already running");
            return false;
        }

        let result = self.catalog.persist_all();
        let ok = match result {
            Ok(durations) => {
                let mut health = self.health.lock();
                health.passes_ok += 1;
                health.last_pass_durations = durations;
                Metrics::incr(&self.metrics.persist_passes_ok);
                true
            }
            Err(e) => {
                error!(error = %e, "persistence pass failed");
                let mut health = self.health.lock();
                health.error_count += 1;
                health.last_error_ms = Some(now_ms());
                Metrics::incr(&self.metrics.persist_errors);
                self.metrics
                    .persist_last_error_ms
                    .store(now_ms(), Ordering::Relaxed);
                false
            }
        };

        // The flag resets on every path out.
        self.running.store(false, Ordering::SeqCst);
        ok
    }

    pub fn health(&self) -> PersistenceHealth {
        self.health.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    fn scheduler(dir: &std::path::Path, online: bool) -> Arc<PersistenceScheduler> {
        let catalog = Arc::new(Catalog::open(dir, StorageConfig::default()).unwrap());
        let membership = Arc::new(Membership::new(Uuid::new_v4(), Ipv4Addr::LOCALHOST));
        membership.set_online(online);
        Arc::new(PersistenceScheduler::new(
            catalog,
            membership,
            Arc::new(Metrics::new()),
            PersistenceConfig::default(),
        ))
    }

    #[test]
    fn offline_node_skips_quickly_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), false);

        let started = std::time::Instant::now();
        assert!(!scheduler.perform_persist_to_disk());
        assert!(started.elapsed() < Duration::from_millis(10));
        assert!(!scheduler.is_running());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn successful_pass_counts_and_resets_flag() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), true);
        scheduler.catalog.create_database("u").unwrap();

        assert!(scheduler.perform_persist_to_disk());
        let health = scheduler.health();
        assert_eq!(health.passes_ok, 1);
        assert_eq!(health.error_count, 0);
        assert!(!scheduler.is_running());
    }

    #[test]
    fn single_flight_rejects_overlapping_passes() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), true);
        scheduler.catalog.create_database("u").unwrap();

        // While a pass is in flight, every other caller is turned away.
        scheduler.running.store(true, Ordering::SeqCst);
        let rejected: Vec<bool> = (0..4)
            .map(|_| {
                let s = scheduler.clone();
                std::thread::spawn(move || s.perform_persist_to_disk())
            })
            .map(|handle| handle.join().unwrap())
            .collect();
        assert!(rejected.iter().all(|ok| !ok));

        // Once the in-flight pass finishes, the next caller succeeds.
        scheduler.running.store(false, Ordering::SeqCst);
        assert!(scheduler.perform_persist_to_disk());
        assert_eq!(scheduler.health().passes_ok, 1);
    }
}
