//! LSM Engine
//!
//! One engine per `(database, table)`. Writes land in the active memtable;
//! when it reaches its size threshold it is atomically swapped for a fresh
//! one and the frozen snapshot queues for flushing. Reads consult the active
//! memtable, then frozen snapshots newest-first, then SSTables newest-first;
//! the first non-absent answer wins and a tombstone reads as `None`.
//!
//! A `MANIFEST` file in the table directory lists the live SSTable file
//! names newest-first and is rewritten atomically (tmp + rename) after every
//! flush and compaction, so readers never observe a partial swap.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::errors::{SerengetiError, SerengetiResult};
use crate::storage::memtable::{MemEntry, MemTable, MemTableSnapshot};
use crate::storage::sstable::{SsLookup, SsTable};

const MANIFEST_FILE: &str = "MANIFEST";

struct LsmInner {
    active: MemTable,
    /// Frozen snapshots awaiting flush, newest first.
    frozen: VecDeque<Arc<MemTableSnapshot>>,
    /// Live SSTables, newest first.
    tables: Vec<Arc<SsTable>>,
}

/// Per-table storage engine: active memtable + frozen queue + SSTable stack.
pub struct LsmEngine {
    dir: PathBuf,
    config: StorageConfig,
    inner: RwLock<LsmInner>,
    sequence: AtomicU64,
    next_file_id: AtomicU64,
    compacting: AtomicBool,
}

/// Point-in-time counters for metrics and tests.
#[derive(Debug, Clone)]
pub struct LsmStats {
    pub memtable_bytes: usize,
    pub memtable_entries: usize,
    pub frozen_count: usize,
    pub sstable_count: usize,
}

impl LsmEngine {
    /// Opens (or initializes) the engine rooted at `dir`, replaying the
    /// manifest to reattach existing SSTables.
    pub fn open(dir: &Path, config: StorageConfig) -> SerengetiResult<LsmEngine> {
        std::fs::create_dir_all(dir)?;

        let mut tables = Vec::new();
        let mut max_file_id = 0u64;
        let mut max_sequence = 0u64;
        let manifest_path = dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            for line in std::fs::read_to_string(&manifest_path)?.lines() {
                let name = line.trim();
                if name.is_empty() {
                    continue;
                }
                let file_id = parse_file_id(name).ok_or_else(|| {
                    SerengetiError::Corrupt(format!("manifest references bad name '{name}'"))
                })?;
                let table = SsTable::open(&dir.join(name), file_id)?;
                max_file_id = max_file_id.max(file_id);
                for (_, entry) in table.read_all()? {
                    max_sequence = max_sequence.max(entry.sequence);
                }
                tables.push(Arc::new(table));
            }
        }

        Ok(LsmEngine {
            dir: dir.to_path_buf(),
            inner: RwLock::new(LsmInner {
                active: MemTable::new(config.memtable_max_bytes),
                frozen: VecDeque::new(),
                tables,
            }),
            config,
            sequence: AtomicU64::new(max_sequence + 1),
            next_file_id: AtomicU64::new(max_file_id + 1),
            compacting: AtomicBool::new(false),
        })
    }

    /// Writes a key/value pair. Null-safe policies: an empty key is a no-op,
    /// a `None` value is a delete.
    pub fn put(&self, key: &[u8], value: Option<&[u8]>) -> SerengetiResult<()> {
        if key.is_empty() {
            return Ok(());
        }
        let Some(value) = value else {
            return self.delete(key);
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let needs_freeze = {
            let mut inner = self.inner.write();
            inner.active.put(
                Bytes::copy_from_slice(key),
                MemEntry::put(sequence, Bytes::copy_from_slice(value)),
            )
        };
        if needs_freeze {
            self.freeze_active();
            self.flush_frozen()?;
        }
        Ok(())
    }

    /// Records a tombstone for the key.
    pub fn delete(&self, key: &[u8]) -> SerengetiResult<()> {
        if key.is_empty() {
            return Ok(());
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let needs_freeze = {
            let mut inner = self.inner.write();
            inner
                .active
                .delete(Bytes::copy_from_slice(key), sequence)
        };
        if needs_freeze {
            self.freeze_active();
            self.flush_frozen()?;
        }
        Ok(())
    }

    /// Reads a key. Tombstones and absent keys both read as `None`; an empty
    /// key reads as `None`.
    pub fn get(&self, key: &[u8]) -> SerengetiResult<Option<Bytes>> {
        if key.is_empty() {
            return Ok(None);
        }
        let (frozen, tables) = {
            let inner = self.inner.read();
            if let Some(entry) = inner.active.get(key) {
                return Ok(entry.value.clone());
            }
            (inner.frozen.clone(), inner.tables.clone())
        };

        for snapshot in &frozen {
            if let Some(entry) = snapshot.get(key) {
                return Ok(entry.value.clone());
            }
        }
        for table in &tables {
            if !table.might_contain(key) {
                continue;
            }
            match table.get(key)? {
                SsLookup::Found(value) => return Ok(Some(value)),
                SsLookup::Tombstone => return Ok(None),
                SsLookup::NotFound => continue,
            }
        }
        Ok(None)
    }

    /// Merged live view of every key: newest entry wins, tombstones elided.
    pub fn scan(&self) -> SerengetiResult<Vec<(Bytes, Bytes)>> {
        let merged = self.merged_entries()?;
        Ok(merged
            .into_iter()
            .filter_map(|(key, entry)| entry.value.map(|v| (key, v)))
            .collect())
    }

    /// Swaps the active memtable for a fresh one, queueing the snapshot.
    fn freeze_active(&self) {
        let mut inner = self.inner.write();
        if inner.active.is_empty() {
            return;
        }
        let snapshot = Arc::new(inner.active.snapshot());
        inner.active = MemTable::new(self.config.memtable_max_bytes);
        inner.frozen.push_front(snapshot);
    }

    /// Flushes queued frozen snapshots to SSTables, oldest first, updating
    /// the manifest after each one.
    pub fn flush_frozen(&self) -> SerengetiResult<usize> {
        let mut flushed = 0;
        loop {
            let oldest = {
                let inner = self.inner.read();
                inner.frozen.back().cloned()
            };
            let Some(snapshot) = oldest else { break };

            let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
            let path = self.dir.join(sstable_name(file_id));
            let table = SsTable::create(
                &path,
                file_id,
                snapshot.len(),
                self.config.bloom_fpr,
                snapshot.iter(),
            )?;
            debug!(table = %path.display(), entries = snapshot.len(), "flushed memtable");

            {
                let mut inner = self.inner.write();
                inner.frozen.pop_back();
                inner.tables.insert(0, Arc::new(table));
                self.write_manifest(&inner.tables)?;
            }
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Forces all buffered state onto disk; used by the persistence
    /// scheduler.
    pub fn save_to_disk(&self) -> SerengetiResult<()> {
        self.freeze_active();
        self.flush_frozen()?;
        Ok(())
    }

    /// Merges the oldest level-0 tables when their count reaches the
    /// configured trigger. Single-flight per engine; a pass that loses the
    /// flag race simply returns `false`.
    ///
    /// Merge rule: newest entry per key wins. Tombstones are preserved
    /// unless the merge consumes every table in the stack (bottom level), in
    /// which case they are dropped.
    pub fn maybe_compact(&self) -> SerengetiResult<bool> {
        if self
            .compacting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        let result = self.compact_once();
        self.compacting.store(false, Ordering::SeqCst);
        result
    }

    fn compact_once(&self) -> SerengetiResult<bool> {
        let (inputs, reaches_bottom) = {
            let inner = self.inner.read();
            if inner.tables.len() < self.config.compaction_trigger {
                return Ok(false);
            }
            let count = self.config.compaction_trigger;
            let start = inner.tables.len() - count;
            (
                inner.tables[start..].to_vec(),
                start == 0 && inner.frozen.is_empty(),
            )
        };

        // Newest-wins merge across the inputs (inputs are newest-first).
        let mut merged: std::collections::BTreeMap<Bytes, MemEntry> =
            std::collections::BTreeMap::new();
        for table in inputs.iter().rev() {
            for (key, entry) in table.read_all()? {
                match merged.get(&key) {
                    Some(existing) if existing.sequence >= entry.sequence => {}
                    _ => {
                        merged.insert(key, entry);
                    }
                }
            }
        }
        if reaches_bottom {
            merged.retain(|_, entry| !entry.is_tombstone());
        }

        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(sstable_name(file_id));
        let output = SsTable::create(
            &path,
            file_id,
            merged.len().max(1),
            self.config.bloom_fpr,
            merged.iter(),
        )?;

        // Atomic stack swap, then remove the consumed files.
        let consumed: Vec<PathBuf> = {
            let mut inner = self.inner.write();
            let keep = inner.tables.len() - inputs.len();
            let consumed = inner.tables.split_off(keep);
            inner.tables.push(Arc::new(output));
            self.write_manifest(&inner.tables)?;
            consumed.iter().map(|t| t.path().to_path_buf()).collect()
        };
        for path in consumed {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "failed to remove compacted sstable");
            }
        }

        info!(
            table_dir = %self.dir.display(),
            inputs = inputs.len(),
            output_entries = merged.len(),
            "compaction complete"
        );
        Ok(true)
    }

    fn write_manifest(&self, tables: &[Arc<SsTable>]) -> SerengetiResult<()> {
        let listing: String = tables
            .iter()
            .map(|t| format!("{}\n", sstable_name(t.file_id())))
            .collect();
        let tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));
        std::fs::write(&tmp, listing)?;
        std::fs::rename(&tmp, self.dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    /// Full merge of memtable + frozen + SSTables, newest entry per key.
    fn merged_entries(&self) -> SerengetiResult<Vec<(Bytes, MemEntry)>> {
        let (active, frozen, tables) = {
            let inner = self.inner.read();
            (inner.active.snapshot(), inner.frozen.clone(), inner.tables.clone())
        };

        let mut merged: std::collections::BTreeMap<Bytes, MemEntry> =
            std::collections::BTreeMap::new();
        // Oldest sources first so newer entries overwrite.
        for table in tables.iter().rev() {
            for (key, entry) in table.read_all()? {
                insert_if_newer(&mut merged, key, entry);
            }
        }
        for snapshot in frozen.iter().rev() {
            for (key, entry) in snapshot.iter() {
                insert_if_newer(&mut merged, key.clone(), entry.clone());
            }
        }
        for (key, entry) in active.iter() {
            insert_if_newer(&mut merged, key.clone(), entry.clone());
        }
        Ok(merged.into_iter().collect())
    }

    pub fn stats(&self) -> LsmStats {
        let inner = self.inner.read();
        LsmStats {
            memtable_bytes: inner.active.size(),
            memtable_entries: inner.active.len(),
            frozen_count: inner.frozen.len(),
            sstable_count: inner.tables.len(),
        }
    }
}

fn insert_if_newer(
    merged: &mut std::collections::BTreeMap<Bytes, MemEntry>,
    key: Bytes,
    entry: MemEntry,
) {
    match merged.get(&key) {
        Some(existing) if existing.sequence >= entry.sequence => {}
        _ => {
            merged.insert(key, entry);
        }
    }
}

fn sstable_name(file_id: u64) -> String {
    format!("sstable-{file_id:08}.db")
}

fn parse_file_id(name: &str) -> Option<u64> {
    name.strip_prefix("sstable-")?
        .strip_suffix(".db")?
        .parse()
        .ok()
}
