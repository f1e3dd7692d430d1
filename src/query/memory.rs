//! Query Memory Manager
//!
//! One process-wide pool (`budget × query_memory_fraction`) shared by every
//! running query. Each query gets a context with per-operation byte
//! counters; when an allocation does not fit, the manager forces a spill in
//! that operation's registered spill manager and retries exactly once.
//! Releasing a context frees its charges and deletes its spill files.
//!
//! Callers must not hold a spill manager's lock while calling
//! [`MemoryManager::allocate`]; the manager locks it itself to spill.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{SerengetiError, SerengetiResult};
use crate::metrics::Metrics;
use crate::query::spill::SpillManager;

type SharedSpillManager = Arc<Mutex<dyn SpillManager>>;

#[derive(Default)]
struct ContextState {
    per_op: HashMap<String, usize>,
    managers: HashMap<String, SharedSpillManager>,
}

impl ContextState {
    fn total(&self) -> usize {
        self.per_op.values().sum()
    }
}

struct PoolState {
    used: usize,
    contexts: HashMap<Uuid, ContextState>,
}

pub struct MemoryManager {
    pool_bytes: usize,
    spill_dir: PathBuf,
    state: Mutex<PoolState>,
    metrics: Arc<Metrics>,
}

impl MemoryManager {
    pub fn new(pool_bytes: usize, spill_dir: PathBuf, metrics: Arc<Metrics>) -> MemoryManager {
        let _ = std::fs::create_dir_all(&spill_dir);
        MemoryManager {
            pool_bytes,
            spill_dir,
            state: Mutex::new(PoolState {
                used: 0,
                contexts: HashMap::new(),
            }),
            metrics,
        }
    }

    pub fn spill_dir(&self) -> &PathBuf {
        &self.spill_dir
    }

    pub fn pool_bytes(&self) -> usize {
        self.pool_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    /// Opens a fresh query context.
    pub fn create_query_context(&self) -> Uuid {
        let query_id = Uuid::new_v4();
        self.state
            .lock()
            .contexts
            .insert(query_id, ContextState::default());
        query_id
    }

    /// Attaches a spill manager to `(query, op)` so allocation pressure can
    /// be relieved.
    pub fn register_spill_manager(
        &self,
        query_id: Uuid,
        op_id: &str,
        manager: SharedSpillManager,
    ) {
        if let Some(context) = self.state.lock().contexts.get_mut(&query_id) {
            context.managers.insert(op_id.to_string(), manager);
        }
    }

    /// Charges `bytes` to `(query, op)`. On pool exhaustion the operation's
    /// spill manager is forced to spill and the charge retries once; `false`
    /// means the query should abort with an out-of-memory error.
    pub fn allocate(&self, query_id: Uuid, op_id: &str, bytes: usize) -> bool {
        if self.try_charge(query_id, op_id, bytes) {
            return true;
        }

        // Force a spill in this operation, then retry exactly once.
        let manager = self
            .state
            .lock()
            .contexts
            .get(&query_id)
            .and_then(|context| context.managers.get(op_id).cloned());
        let Some(manager) = manager else {
            return false;
        };
        match manager.lock().spill_to_disk() {
            Ok(0) => {
                debug!(op = op_id, "nothing left to spill");
                return false;
            }
            Ok(freed) => {
                self.record_spill(query_id, op_id, freed);
            }
            Err(e) => {
                warn!(op = op_id, error = %e, "forced spill failed");
                return false;
            }
        }
        self.try_charge(query_id, op_id, bytes)
    }

    fn try_charge(&self, query_id: Uuid, op_id: &str, bytes: usize) -> bool {
        let mut state = self.state.lock();
        if state.used + bytes > self.pool_bytes {
            return false;
        }
        let Some(context) = state.contexts.get_mut(&query_id) else {
            return false;
        };
        *context.per_op.entry(op_id.to_string()).or_insert(0) += bytes;
        state.used += bytes;
        true
    }

    /// Returns `bytes` from `(query, op)` to the pool.
    pub fn free(&self, query_id: Uuid, op_id: &str, bytes: usize) {
        let mut state = self.state.lock();
        if let Some(context) = state.contexts.get_mut(&query_id) {
            let charged = context.per_op.entry(op_id.to_string()).or_insert(0);
            let returned = bytes.min(*charged);
            *charged -= returned;
            state.used -= returned;
        }
    }

    /// Explicit spill of one operation's state.
    pub fn spill_to_disk(&self, query_id: Uuid, op_id: &str) -> SerengetiResult<usize> {
        let manager = self
            .state
            .lock()
            .contexts
            .get(&query_id)
            .and_then(|context| context.managers.get(op_id).cloned())
            .ok_or_else(|| {
                SerengetiError::Internal(format!("no spill manager registered for {op_id}"))
            })?;
        let freed = manager.lock().spill_to_disk()?;
        if freed > 0 {
            self.record_spill(query_id, op_id, freed);
        }
        Ok(freed)
    }

    /// Loads one operation's most recent spill back, charging the pool.
    pub fn read_from_disk(&self, query_id: Uuid, op_id: &str) -> SerengetiResult<usize> {
        let manager = self
            .state
            .lock()
            .contexts
            .get(&query_id)
            .and_then(|context| context.managers.get(op_id).cloned())
            .ok_or_else(|| {
                SerengetiError::Internal(format!("no spill manager registered for {op_id}"))
            })?;
        let loaded = manager.lock().read_from_disk()?;
        if loaded > 0 && !self.try_charge(query_id, op_id, loaded) {
            // The pool cannot hold the reloaded state; push it back out.
            let _ = manager.lock().spill_to_disk();
            return Err(SerengetiError::MemoryExhausted {
                requested: loaded,
                available: self.pool_bytes.saturating_sub(self.used_bytes()),
            });
        }
        Ok(loaded)
    }

    /// Frees every charge and spill file the query owns.
    pub fn release_query_context(&self, query_id: Uuid) {
        let context = {
            let mut state = self.state.lock();
            let context = state.contexts.remove(&query_id);
            if let Some(ref context) = context {
                let total = context.total();
                state.used -= total.min(state.used);
            }
            context
        };
        let Some(context) = context else { return };
        for manager in context.managers.values() {
            manager.lock().cleanup();
        }
    }

    fn record_spill(&self, query_id: Uuid, op_id: &str, freed: usize) {
        Metrics::incr(&self.metrics.spill_count);
        Metrics::add(&self.metrics.spill_bytes, freed as u64);
        self.free(query_id, op_id, freed);
        debug!(query = %query_id, op = op_id, freed, "spill relieved memory pressure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{OrderKey, SortDirection};
    use crate::query::spill::SortSpillManager;
    use crate::types::{RowData, Value};

    fn manager(pool: usize, dir: &std::path::Path) -> MemoryManager {
        MemoryManager::new(pool, dir.to_path_buf(), Arc::new(Metrics::new()))
    }

    #[test]
    fn charges_and_frees_balance() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(1000, dir.path());
        let query = memory.create_query_context();

        assert!(memory.allocate(query, "op-1", 600));
        assert!(memory.allocate(query, "op-2", 300));
        assert!(!memory.allocate(query, "op-1", 200));
        memory.free(query, "op-2", 300);
        assert!(memory.allocate(query, "op-1", 200));

        memory.release_query_context(query);
        assert_eq!(memory.used_bytes(), 0);
    }

    #[test]
    fn allocation_failure_forces_spill_then_retries() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(2_000, dir.path());
        let query = memory.create_query_context();

        let spill = Arc::new(Mutex::new(SortSpillManager::new(
            memory.spill_dir(),
            query,
            "sort-0",
            vec![OrderKey {
                column: "age".into(),
                direction: SortDirection::Ascending,
            }],
            16,
        )));
        memory.register_spill_manager(query, "sort-0", spill.clone());

        // Fill the pool through the manager-tracked path.
        let mut charged = 0;
        loop {
            let mut row = RowData::new();
            row.insert("age".into(), Value::Int(charged as i64));
            let bytes = spill.lock().add_row(row);
            if !memory.allocate(query, "sort-0", bytes) {
                break;
            }
            charged += 1;
            if charged > 1_000 {
                break;
            }
        }
        // The forced spill path must have fired at least once before the
        // pool finally refused.
        assert!(
            memory
                .metrics
                .spill_count
                .load(std::sync::atomic::Ordering::Relaxed)
                >= 1
        );

        memory.release_query_context(query);
        assert_eq!(memory.used_bytes(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unknown_context_never_allocates() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(1000, dir.path());
        assert!(!memory.allocate(Uuid::new_v4(), "op", 10));
    }
}
