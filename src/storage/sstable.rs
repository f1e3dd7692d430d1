//! SSTable
//!
//! Immutable on-disk sorted run. Created once from a memtable snapshot (or a
//! compaction merge) and never modified afterwards; deletions inside are
//! tombstone entries.
//!
//! ## File layout (all integers little-endian)
//!
//! ```text
//! Header : MAGIC(4)="SSTB" | VERSION(4) | ENTRY_COUNT(8) | BLOOM_OFFSET(8) | INDEX_OFFSET(8) | FOOTER_OFFSET(8)
//! Entries: [ KEYLEN(4) | KEY | SEQ(8) | FLAGS(1) | VALLEN(4) | VAL ]+
//! Sparse : [ KEYLEN(4) | KEY | FILE_OFFSET(8) ]   (every SPARSE_INTERVAL entries)
//! Bloom  : NUM_BITS(8) | NUM_HASHES(4) | BITS
//! Footer : ENTRY_COUNT(8) | BLOOM_OFFSET(8) | INDEX_OFFSET(8) | CRC32(8)
//! ```
//!
//! The header is written with zeroed offsets first and back-patched once the
//! body is complete; the footer CRC32 covers the final 40 header bytes. The
//! whole file goes to `<path>.tmp`, is fsynced, then atomically renamed, so a
//! crash mid-write never leaves a readable-but-partial table.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::errors::{SerengetiError, SerengetiResult};
use crate::storage::bloom::BloomFilter;
use crate::storage::memtable::MemEntry;

pub const MAGIC: &[u8; 4] = b"SSTB";
pub const VERSION: u32 = 1;
const HEADER_LEN: u64 = 4 + 4 + 8 + 8 + 8 + 8;
const FOOTER_LEN: u64 = 8 + 8 + 8 + 8;
/// One sparse index entry per this many data entries (the first entry is
/// always indexed).
pub const SPARSE_INTERVAL: usize = 16;
const FLAG_TOMBSTONE: u8 = 0b0000_0001;

/// Sanity caps applied while reading, so a corrupt length field cannot
/// trigger a huge allocation.
const MAX_KEY_LEN: usize = 64 * 1024;
const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// Result of a point lookup. `Tombstone` is distinct from `NotFound`: a
/// tombstone must shadow older tables, absence must not.
#[derive(Debug, Clone, PartialEq)]
pub enum SsLookup {
    Found(Bytes),
    Tombstone,
    NotFound,
}

/// An open, immutable SSTable: parsed header, bloom filter and sparse index
/// in memory, data entries read on demand through a shared file handle.
pub struct SsTable {
    path: PathBuf,
    file_id: u64,
    entry_count: u64,
    bloom: BloomFilter,
    /// `(first key of block, file offset)` pairs in ascending key order.
    sparse_index: Vec<(Bytes, u64)>,
    index_offset: u64,
    file: Mutex<BufReader<File>>,
}

impl SsTable {
    /// Writes a new SSTable from an iterator of entries in ascending key
    /// order, then opens it. `entry_hint` sizes the bloom filter; a few
    /// percent of slack is harmless.
    pub fn create<'a, I>(
        path: &Path,
        file_id: u64,
        entry_hint: usize,
        bloom_fpr: f64,
        entries: I,
    ) -> SerengetiResult<SsTable>
    where
        I: Iterator<Item = (&'a Bytes, &'a MemEntry)>,
    {
        let tmp_path = path.with_extension("tmp");
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(raw);

        // Placeholder header, back-patched below.
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&[0u8; 32])?;

        let mut bloom = BloomFilter::new(entry_hint.max(1), bloom_fpr);
        let mut sparse: Vec<(Bytes, u64)> = Vec::new();
        let mut entry_count: u64 = 0;
        let mut offset: u64 = HEADER_LEN;

        for (key, entry) in entries {
            if entry_count as usize % SPARSE_INTERVAL == 0 {
                sparse.push((key.clone(), offset));
            }
            bloom.insert(key);

            let value = entry.value.as_deref().unwrap_or(&[]);
            let flags = if entry.is_tombstone() { FLAG_TOMBSTONE } else { 0 };

            writer.write_all(&(key.len() as u32).to_le_bytes())?;
            writer.write_all(key)?;
            writer.write_all(&entry.sequence.to_le_bytes())?;
            writer.write_all(&[flags])?;
            writer.write_all(&(value.len() as u32).to_le_bytes())?;
            writer.write_all(value)?;

            offset += 4 + key.len() as u64 + 8 + 1 + 4 + value.len() as u64;
            entry_count += 1;
        }

        let index_offset = offset;
        for (key, entry_offset) in &sparse {
            writer.write_all(&(key.len() as u32).to_le_bytes())?;
            writer.write_all(key)?;
            writer.write_all(&entry_offset.to_le_bytes())?;
            offset += 4 + key.len() as u64 + 8;
        }

        let bloom_offset = offset;
        bloom.write_to(&mut writer)?;
        offset += bloom.serialized_len() as u64;

        let footer_offset = offset;
        let header = encode_header(entry_count, bloom_offset, index_offset, footer_offset);

        // Footer: echoed offsets + CRC over the final header bytes.
        writer.write_all(&entry_count.to_le_bytes())?;
        writer.write_all(&bloom_offset.to_le_bytes())?;
        writer.write_all(&index_offset.to_le_bytes())?;
        writer.write_all(&(crc32fast::hash(&header) as u64).to_le_bytes())?;

        // Back-patch the header, fsync, atomic rename.
        let mut file = writer.into_inner().map_err(|e| {
            SerengetiError::Internal(format!("sstable buffer flush failed: {e}"))
        })?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;

        SsTable::open(path, file_id)
    }

    /// Opens an existing file: validates magic, version and footer CRC, then
    /// loads the bloom filter and sparse index.
    pub fn open(path: &Path, file_id: u64) -> SerengetiResult<SsTable> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN + FOOTER_LEN {
            return Err(SerengetiError::Corrupt(format!(
                "sstable {} too small ({file_len} bytes)",
                path.display()
            )));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != MAGIC[..] {
            return Err(SerengetiError::Corrupt(format!(
                "sstable {} has bad magic",
                path.display()
            )));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(SerengetiError::Corrupt(format!(
                "sstable {} has unsupported version {version}",
                path.display()
            )));
        }
        let entry_count = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let bloom_offset = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let index_offset = u64::from_le_bytes(header[24..32].try_into().unwrap());
        let footer_offset = u64::from_le_bytes(header[32..40].try_into().unwrap());

        if index_offset < HEADER_LEN
            || bloom_offset < index_offset
            || footer_offset < bloom_offset
            || footer_offset + FOOTER_LEN != file_len
        {
            return Err(SerengetiError::Corrupt(format!(
                "sstable {} has inconsistent section offsets",
                path.display()
            )));
        }

        // Footer echo + CRC check.
        file.seek(SeekFrom::Start(footer_offset))?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact(&mut footer)?;
        let echo_count = u64::from_le_bytes(footer[0..8].try_into().unwrap());
        let echo_bloom = u64::from_le_bytes(footer[8..16].try_into().unwrap());
        let echo_index = u64::from_le_bytes(footer[16..24].try_into().unwrap());
        let crc = u64::from_le_bytes(footer[24..32].try_into().unwrap());
        if echo_count != entry_count || echo_bloom != bloom_offset || echo_index != index_offset {
            return Err(SerengetiError::Corrupt(format!(
                "sstable {} footer does not echo the header",
                path.display()
            )));
        }
        if crc != crc32fast::hash(&header) as u64 {
            return Err(SerengetiError::Corrupt(format!(
                "sstable {} header CRC mismatch",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(bloom_offset))?;
        let bloom = BloomFilter::read_from(&mut file)?;

        file.seek(SeekFrom::Start(index_offset))?;
        let mut sparse = Vec::new();
        let mut cursor = index_offset;
        while cursor < bloom_offset {
            let key = read_length_prefixed(&mut file, MAX_KEY_LEN)?;
            let mut off = [0u8; 8];
            file.read_exact(&mut off)?;
            cursor += 4 + key.len() as u64 + 8;
            sparse.push((Bytes::from(key), u64::from_le_bytes(off)));
        }

        file.seek(SeekFrom::Start(0))?;
        Ok(SsTable {
            path: path.to_path_buf(),
            file_id,
            entry_count,
            bloom,
            sparse_index: sparse,
            index_offset,
            file: Mutex::new(BufReader::new(file)),
        })
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bloom-filter gate for point lookups.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom.might_contain(key)
    }

    /// Point lookup: bloom gate, binary search of the sparse index, then a
    /// forward scan of at most [`SPARSE_INTERVAL`] entries.
    pub fn get(&self, key: &[u8]) -> SerengetiResult<SsLookup> {
        if !self.bloom.might_contain(key) {
            return Ok(SsLookup::NotFound);
        }

        // Greatest indexed key <= target.
        let block = match self
            .sparse_index
            .partition_point(|(first_key, _)| &first_key[..] <= key)
        {
            0 => return Ok(SsLookup::NotFound),
            n => n - 1,
        };
        let start = self.sparse_index[block].1;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(start))?;
        let mut cursor = start;
        for _ in 0..SPARSE_INTERVAL {
            if cursor >= self.index_offset {
                break;
            }
            let (entry_key, entry, consumed) = read_entry(&mut *file)?;
            cursor += consumed;
            match entry_key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => {
                    return Ok(match entry.value {
                        Some(value) => SsLookup::Found(value),
                        None => SsLookup::Tombstone,
                    });
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(SsLookup::NotFound)
    }

    /// Reads every entry in key order. Used by compaction and full scans.
    pub fn read_all(&self) -> SerengetiResult<Vec<(Bytes, MemEntry)>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut entries = Vec::with_capacity(self.entry_count as usize);
        let mut cursor = HEADER_LEN;
        while cursor < self.index_offset {
            let (key, entry, consumed) = read_entry(&mut *file)?;
            cursor += consumed;
            entries.push((Bytes::from(key), entry));
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("path", &self.path)
            .field("file_id", &self.file_id)
            .field("entries", &self.entry_count)
            .finish()
    }
}

fn encode_header(
    entry_count: u64,
    bloom_offset: u64,
    index_offset: u64,
    footer_offset: u64,
) -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[0..4].copy_from_slice(MAGIC);
    header[4..8].copy_from_slice(&VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&entry_count.to_le_bytes());
    header[16..24].copy_from_slice(&bloom_offset.to_le_bytes());
    header[24..32].copy_from_slice(&index_offset.to_le_bytes());
    header[32..40].copy_from_slice(&footer_offset.to_le_bytes());
    header
}

fn read_length_prefixed<R: Read>(reader: &mut R, cap: usize) -> SerengetiResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > cap {
        return Err(SerengetiError::Corrupt(format!(
            "length field {len} exceeds cap {cap}"
        )));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(data)
}

/// Reads one data entry; returns `(key, entry, bytes consumed)`.
fn read_entry<R: Read>(reader: &mut R) -> SerengetiResult<(Vec<u8>, MemEntry, u64)> {
    let key = read_length_prefixed(reader, MAX_KEY_LEN)?;

    let mut seq_buf = [0u8; 8];
    reader.read_exact(&mut seq_buf)?;
    let sequence = u64::from_le_bytes(seq_buf);

    let mut flags = [0u8; 1];
    reader.read_exact(&mut flags)?;

    let value = read_length_prefixed(reader, MAX_VALUE_LEN)?;
    let consumed = 4 + key.len() as u64 + 8 + 1 + 4 + value.len() as u64;

    let entry = if flags[0] & FLAG_TOMBSTONE != 0 {
        MemEntry::tombstone(sequence)
    } else {
        MemEntry::put(sequence, Bytes::from(value))
    };
    Ok((key, entry, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memtable::MemTable;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn sample_memtable(n: u32) -> MemTable {
        let mut table = MemTable::new(usize::MAX);
        for i in 0..n {
            table.put(
                b(&format!("key-{i:05}")),
                MemEntry::put(i as u64, b(&format!("value-{i}"))),
            );
        }
        table
    }

    #[test]
    fn create_then_get_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sstable-1.db");
        let memtable = sample_memtable(100);
        let snapshot = memtable.snapshot();

        let table =
            SsTable::create(&path, 1, snapshot.len(), 0.01, snapshot.iter()).unwrap();

        for i in 0..100u32 {
            let key = format!("key-{i:05}");
            match table.get(key.as_bytes()).unwrap() {
                SsLookup::Found(v) => assert_eq!(v, b(&format!("value-{i}"))),
                other => panic!("expected Found for {key}, got {other:?}"),
            }
        }
        assert_eq!(table.get(b"key-99999").unwrap(), SsLookup::NotFound);
    }

    #[test]
    fn reopen_yields_identical_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sstable-2.db");
        let memtable = sample_memtable(40);
        let snapshot = memtable.snapshot();
        SsTable::create(&path, 2, snapshot.len(), 0.01, snapshot.iter()).unwrap();

        let reopened = SsTable::open(&path, 2).unwrap();
        assert_eq!(reopened.entry_count(), 40);
        let all = reopened.read_all().unwrap();
        assert_eq!(all.len(), 40);
        for ((key, entry), (snap_key, snap_entry)) in all.iter().zip(snapshot.iter()) {
            assert_eq!(key, snap_key);
            assert_eq!(entry, snap_entry);
        }
    }

    #[test]
    fn tombstones_are_distinct_from_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sstable-3.db");
        let mut memtable = MemTable::new(usize::MAX);
        memtable.put(b("alive"), MemEntry::put(1, b("x")));
        memtable.delete(b("dead"), 2);
        let snapshot = memtable.snapshot();
        let table = SsTable::create(&path, 3, 2, 0.01, snapshot.iter()).unwrap();

        assert_eq!(table.get(b"dead").unwrap(), SsLookup::Tombstone);
        assert!(matches!(table.get(b"alive").unwrap(), SsLookup::Found(_)));
        assert_eq!(table.get(b"never").unwrap(), SsLookup::NotFound);
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sstable-4.db");
        let memtable = sample_memtable(5);
        let snapshot = memtable.snapshot();
        SsTable::create(&path, 4, 5, 0.01, snapshot.iter()).unwrap();

        // Stomp on the magic.
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] = b'X';
        std::fs::write(&path, raw).unwrap();

        assert!(matches!(
            SsTable::open(&path, 4),
            Err(SerengetiError::Corrupt(_))
        ));
    }

    #[test]
    fn sparse_index_covers_block_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sstable-5.db");
        // More than one sparse block.
        let memtable = sample_memtable(SPARSE_INTERVAL as u32 * 3 + 7);
        let snapshot = memtable.snapshot();
        let table =
            SsTable::create(&path, 5, snapshot.len(), 0.01, snapshot.iter()).unwrap();

        // First key of each block and the very last key must both resolve.
        let boundary = format!("key-{:05}", SPARSE_INTERVAL);
        assert!(matches!(
            table.get(boundary.as_bytes()).unwrap(),
            SsLookup::Found(_)
        ));
        let last = format!("key-{:05}", SPARSE_INTERVAL * 3 + 6);
        assert!(matches!(
            table.get(last.as_bytes()).unwrap(),
            SsLookup::Found(_)
        ));
    }
}
