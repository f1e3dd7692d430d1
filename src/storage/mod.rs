//! Storage Layer
//!
//! Log-structured merge storage: an in-memory [`memtable::MemTable`] per
//! engine, immutable [`sstable::SsTable`] runs on disk, and the
//! [`lsm::LsmEngine`] tying them together with flush and compaction.

pub mod bloom;
pub mod lsm;
pub mod memtable;
pub mod sstable;

pub use bloom::BloomFilter;
pub use lsm::{LsmEngine, LsmStats};
pub use memtable::{MemEntry, MemTable, MemTableSnapshot};
pub use sstable::{SsLookup, SsTable};
