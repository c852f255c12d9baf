/// Probabilistic membership filter used to reject point lookups for ids
/// that were never written, before touching the primary index.
///
/// - If any probed bit is 0 the id is DEFINITELY NOT in the set
/// - If all probed bits are 1 the id is PROBABLY in the set
///
/// Sized from an expected item count `n` and target false-positive rate
/// `p`:
///
///   m = ceil(-n * ln p / (ln 2)^2) bits
///   k = round((m / n) * ln 2) probes
///
/// The k probes are derived from two base CRC32 hashes over the item and
/// the byte-reversed item: probe i is (h1 + i * h2) mod m. No removal;
/// the filter is not persisted and is rebuilt from the index on startup.
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` at the given rate.
    ///
    /// # Panics
    /// Panics if `expected_items` is 0 or the rate is not in (0, 1).
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false positive rate must be in (0, 1)"
        );

        let n = expected_items as f64;
        let ln2 = std::f64::consts::LN_2;

        let num_bits = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil() as u64;
        let num_bits = num_bits.max(64);

        let num_hashes = ((num_bits as f64 / n) * ln2).round() as u32;
        let num_hashes = num_hashes.max(1);

        let num_words = num_bits.div_ceil(64) as usize;

        Self {
            bits: vec![0u64; num_words],
            num_bits,
            num_hashes,
        }
    }

    /// Add an item to the filter.
    pub fn add(&mut self, item: &[u8]) {
        let (h1, h2) = Self::hash_pair(item);
        for i in 0..self.num_hashes {
            let pos = self.probe(h1, h2, i);
            self.set_bit(pos);
        }
    }

    /// Check whether an item MIGHT be in the set.
    /// false means definitely not; true means probably.
    pub fn might_contain(&self, item: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(item);
        for i in 0..self.num_hashes {
            let pos = self.probe(h1, h2, i);
            if !self.check_bit(pos) {
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

    /// Two base hashes: CRC32 of the item and of the item reversed.
    fn hash_pair(item: &[u8]) -> (u32, u32) {
        let h1 = crc32fast::hash(item);
        let reversed: Vec<u8> = item.iter().rev().copied().collect();
        let h2 = crc32fast::hash(&reversed);
        (h1, h2)
    }

    fn probe(&self, h1: u32, h2: u32, i: u32) -> u64 {
        (h1 as u64).wrapping_add((i as u64).wrapping_mul(h2 as u64)) % self.num_bits
    }

    fn set_bit(&mut self, pos: u64) {
        let word = (pos / 64) as usize;
        let bit = pos % 64;
        self.bits[word] |= 1 << bit;
    }

    fn check_bit(&self, pos: u64) -> bool {
        let word = (pos / 64) as usize;
        let bit = pos % 64;
        (self.bits[word] >> bit) & 1 == 1
    }
}
