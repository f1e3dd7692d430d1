//! Process Metrics Registry
//!
//! Plain atomic counters shared by every subsystem and rendered as JSON by
//! `GET /metrics`. Replication failures, spills, flushes and compactions are
//! all recorded here so operators can see a node's behavior without logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Shared counter registry. Cheap to clone behind an `Arc`.
#[derive(Debug)]
pub struct Metrics {
    started_at: Instant,

    // Server
    pub http_requests: AtomicU64,
    pub queries_executed: AtomicU64,
    pub query_errors: AtomicU64,
    pub statements_parsed: AtomicU64,

    // Network
    pub probes_sent: AtomicU64,
    pub probes_succeeded: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_failed: AtomicU64,
    pub broadcasts: AtomicU64,

    // Storage
    pub memtable_flushes: AtomicU64,
    pub compactions: AtomicU64,

    // Query memory
    pub spill_count: AtomicU64,
    pub spill_bytes: AtomicU64,

    // Persistence scheduler
    pub persist_passes_ok: AtomicU64,
    pub persist_errors: AtomicU64,
    pub persist_last_error_ms: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            http_requests: AtomicU64::new(0),
            queries_executed: AtomicU64::new(0),
            query_errors: AtomicU64::new(0),
            statements_parsed: AtomicU64::new(0),
            probes_sent: AtomicU64::new(0),
            probes_succeeded: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            memtable_flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            spill_count: AtomicU64::new(0),
            spill_bytes: AtomicU64::new(0),
            persist_passes_ok: AtomicU64::new(0),
            persist_errors: AtomicU64::new(0),
            persist_last_error_ms: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Snapshot rendered by `GET /metrics`.
    pub fn snapshot(&self) -> serde_json::Value {
        let load = Ordering::Relaxed;
        serde_json::json!({
            "system": {
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": self.uptime_seconds(),
            },
            "runtime": {
                "worker_threads": std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
            },
            "server": {
                "http_requests": self.http_requests.load(load),
                "queries_executed": self.queries_executed.load(load),
                "query_errors": self.query_errors.load(load),
                "statements_parsed": self.statements_parsed.load(load),
                "memtable_flushes": self.memtable_flushes.load(load),
                "compactions": self.compactions.load(load),
                "spill_count": self.spill_count.load(load),
                "spill_bytes": self.spill_bytes.load(load),
                "persist_passes_ok": self.persist_passes_ok.load(load),
                "persist_errors": self.persist_errors.load(load),
            },
            "network": {
                "probes_sent": self.probes_sent.load(load),
                "probes_succeeded": self.probes_succeeded.load(load),
                "messages_sent": self.messages_sent.load(load),
                "messages_failed": self.messages_failed.load(load),
                "broadcasts": self.broadcasts.load(load),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_contains_all_sections() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.http_requests);
        Metrics::add(&metrics.spill_bytes, 4096);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["server"]["http_requests"], 1);
        assert_eq!(snapshot["server"]["spill_bytes"], 4096);
        assert!(snapshot["system"]["version"].is_string());
        assert!(snapshot["network"]["messages_sent"].is_number());
    }
}
