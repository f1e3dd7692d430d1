//! Bloom Filter
//!
//! Probabilistic membership gate embedded in every SSTable. A negative answer
//! is definitive and lets point lookups skip the file entirely; positives may
//! be wrong at roughly the configured false-positive rate.
//!
//! Uses double hashing over two FNV-1a seeds: `h(i) = h1 + i * h2`.

use std::io::{self, Read, Write};

/// Bit-vector bloom filter with `k` derived hash functions.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter for `expected_items` at the target false-positive
    /// rate using the standard optimum: `m = -n ln p / ln(2)^2`,
    /// `k = (m/n) ln 2`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);

        let m = (-n * p.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(8);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k.max(1);

        Self {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            num_bits: m,
            num_hashes: k,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = bit_index(h1, h2, i, self.num_bits);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// `false` means the key is definitely absent.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = bit_index(h1, h2, i, self.num_bits);
            if self.bits[(idx / 8) as usize] >> (idx % 8) & 1 == 0 {
                return false;
            }
        }
        true
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Serialized size: `NUM_BITS(8) | NUM_HASHES(4) | BITS`.
    pub fn serialized_len(&self) -> usize {
        8 + 4 + self.bits.len()
    }

    /// Writes the on-disk form: `NUM_BITS(8) | NUM_HASHES(4) | BITS`,
    /// little-endian.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.num_bits.to_le_bytes())?;
        writer.write_all(&self.num_hashes.to_le_bytes())?;
        writer.write_all(&self.bits)?;
        Ok(())
    }

    /// Reads the on-disk form back. The byte length is derived from
    /// `NUM_BITS`, so no explicit length prefix is needed.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];

        reader.read_exact(&mut buf8)?;
        let num_bits = u64::from_le_bytes(buf8);
        reader.read_exact(&mut buf4)?;
        let num_hashes = u32::from_le_bytes(buf4);

        const MAX_BLOOM_BYTES: u64 = 128 * 1024 * 1024;
        let byte_len = (num_bits + 7) / 8;
        if byte_len > MAX_BLOOM_BYTES || num_hashes == 0 || num_hashes > 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("implausible bloom parameters: {num_bits} bits, {num_hashes} hashes"),
            ));
        }

        let mut bits = vec![0u8; byte_len as usize];
        reader.read_exact(&mut bits)?;

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    (
        fnv1a_64(key, 0xcbf2_9ce4_8422_2325),
        fnv1a_64(key, 0x517c_c1b7_2722_0a95),
    )
}

fn bit_index(h1: u64, h2: u64, i: u32, num_bits: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
}

fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000u32 {
            filter.insert(format!("key-{i}").as_bytes());
        }
        for i in 0..1_000u32 {
            assert!(filter.might_contain(format!("key-{i}").as_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_stays_near_target() {
        let mut filter = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000u32 {
            filter.insert(format!("member-{i}").as_bytes());
        }

        let mut false_positives = 0u32;
        for i in 0..10_000u32 {
            if filter.might_contain(format!("absent-{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // Target 1%; observed must stay under 2%.
        assert!(
            false_positives < 200,
            "observed {false_positives} false positives in 10k lookups"
        );
    }

    #[test]
    fn serialization_round_trip() {
        let mut filter = BloomFilter::new(100, 0.01);
        filter.insert(b"alpha");
        filter.insert(b"beta");

        let mut buf = Vec::new();
        filter.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), filter.serialized_len());

        let restored = BloomFilter::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(restored.num_bits(), filter.num_bits());
        assert_eq!(restored.num_hashes(), filter.num_hashes());
        assert!(restored.might_contain(b"alpha"));
        assert!(restored.might_contain(b"beta"));
    }
}
