//! Query Result Cache
//!
//! Read-only plans are keyed by a fingerprint of the normalized statement
//! (canonical unparse, so casing and spacing differences collide into one
//! entry). Every entry carries the `(db, table)` tags it was computed from;
//! any write to a tagged table invalidates the entry immediately, and a TTL
//! bounds staleness for replicated writes arriving over `/post`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::query::ast::Statement;
use crate::types::RowData;

struct CacheEntry {
    rows: Arc<Vec<RowData>>,
    tags: Vec<(String, String)>,
    inserted_at: Instant,
}

/// Cache counters surfaced by `cache stats`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub evictions: u64,
    pub enabled: bool,
}

pub struct QueryCache {
    enabled: AtomicBool,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<u64, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> QueryCache {
        QueryCache {
            enabled: AtomicBool::new(true),
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Deterministic fingerprint of a normalized statement.
    pub fn fingerprint(statement: &Statement) -> u64 {
        let mut hasher = DefaultHasher::new();
        statement.unparse().hash(&mut hasher);
        hasher.finish()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn get(&self, fingerprint: u64) -> Option<Arc<Vec<RowData>>> {
        if !self.is_enabled() {
            return None;
        }
        let mut entries = self.entries.lock();
        let hit = match entries.get(&fingerprint) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => Some(entry.rows.clone()),
            Some(_) => {
                entries.remove(&fingerprint);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };
        match &hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    pub fn put(&self, fingerprint: u64, tags: Vec<(String, String)>, rows: Arc<Vec<RowData>>) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&fingerprint) {
            // Evict the oldest entry.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| *key)
            {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            fingerprint,
            CacheEntry {
                rows,
                tags,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drops every entry whose tags include `(db, table)`.
    pub fn invalidate(&self, db: &str, table: &str) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            !entry
                .tags
                .iter()
                .any(|(tag_db, tag_table)| tag_db == db && tag_table == table)
        });
        let removed = (before - entries.len()) as u64;
        if removed > 0 {
            self.evictions.fetch_add(removed, Ordering::Relaxed);
        }
    }

    /// Drops every entry touching any table of `db`.
    pub fn invalidate_database(&self, db: &str) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.tags.iter().any(|(tag_db, _)| tag_db == db));
        self.evictions
            .fetch_add((before - entries.len()) as u64, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        self.evictions
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            enabled: self.is_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_statement;

    fn rows() -> Arc<Vec<RowData>> {
        Arc::new(vec![RowData::new()])
    }

    #[test]
    fn equivalent_statements_share_a_fingerprint() {
        let a = parse_statement("select * from u.c where id = 1").unwrap();
        let b = parse_statement("SELECT  *  FROM u.c WHERE id=1").unwrap();
        assert_eq!(QueryCache::fingerprint(&a), QueryCache::fingerprint(&b));

        let c = parse_statement("SELECT * FROM u.c WHERE id = 2").unwrap();
        assert_ne!(QueryCache::fingerprint(&a), QueryCache::fingerprint(&c));
    }

    #[test]
    fn write_invalidates_matching_tag_only() {
        let cache = QueryCache::new(Duration::from_secs(60), 16);
        cache.put(1, vec![("u".into(), "c".into())], rows());
        cache.put(2, vec![("u".into(), "d".into())], rows());

        cache.invalidate("u", "c");
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = QueryCache::new(Duration::from_millis(0), 16);
        cache.put(1, vec![("u".into(), "c".into())], rows());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        cache.put(1, vec![], rows());
        std::thread::sleep(Duration::from_millis(2));
        cache.put(2, vec![], rows());
        std::thread::sleep(Duration::from_millis(2));
        cache.put(3, vec![], rows());

        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn disabling_clears_and_bypasses() {
        let cache = QueryCache::new(Duration::from_secs(60), 16);
        cache.put(1, vec![], rows());
        cache.set_enabled(false);
        assert!(cache.get(1).is_none());
        cache.put(2, vec![], rows());
        assert_eq!(cache.stats().size, 0);
    }
}
