use ember_common::H256;

/// Fixed-size bloom filter over node hashes. Keys are already keccak
/// outputs, so the four probe indexes are sliced straight out of the hash
/// instead of being re-hashed.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    size_bits: u64,
}

impl BloomFilter {
    pub fn new(size_bits: usize) -> Self {
        let size_bits = size_bits.max(64) as u64;
        let words = size_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0u64; words],
            size_bits,
        }
    }

    fn probes(&self, hash: &H256) -> [u64; 4] {
        let bytes = hash.as_bytes();
        std::array::from_fn(|i| {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            u64::from_be_bytes(chunk) % self.size_bits
        })
    }

    pub fn insert(&mut self, hash: &H256) {
        for probe in self.probes(hash) {
            let word = (probe / 64) as usize;
            self.bits[word] |= 1u64 << (probe % 64);
        }
    }

    /// False positives are possible, false negatives are not.
    pub fn contains(&self, hash: &H256) -> bool {
        self.probes(hash).iter().all(|probe| {
            let word = (*probe / 64) as usize;
            (self.bits[word] >> (*probe % 64)) & 1 == 1
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_hashes_are_found() {
        let mut filter = BloomFilter::new(1 << 16);
        let hashes: Vec<H256> = (0u8..100).map(H256::repeat_byte).collect();
        for hash in &hashes {
            filter.insert(hash);
        }
        assert!(hashes.iter().all(|hash| filter.contains(hash)));
    }

    #[test]
    fn fresh_filter_is_empty() {
        let filter = BloomFilter::new(1 << 16);
        assert!(!filter.contains(&H256::repeat_byte(0xaa)));
    }
}
