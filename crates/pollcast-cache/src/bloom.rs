use pollcast_kv::{KvError, SharedKv};
use sha2::{Digest, Sha256};
use std::f64::consts::LN_2;

/// Probabilistic membership filter stored as a bitset in the shared store.
///
/// Bits are never cleared, so there is no removal. Identifiers are not reused,
/// which keeps that acceptable. Each item maps to `hashes` bit positions via
/// double hashing over the two halves of a SHA-256 digest.
#[derive(Clone)]
pub struct BloomFilter {
    kv: SharedKv,
    key: String,
    bits: u64,
    hashes: u32,
}

impl BloomFilter {
    pub fn new(kv: SharedKv, name: &str, bits: u64, hashes: u32) -> Self {
        Self {
            kv,
            key: format!("bloom:{name}"),
            bits: bits.max(8),
            hashes: hashes.max(1),
        }
    }

    /// Size the filter for `expected_items` at the target false-positive rate.
    pub fn with_sizing(
        kv: SharedKv,
        name: &str,
        expected_items: u64,
        false_positive_rate: f64,
    ) -> Self {
        let bits = Self::optimal_bits(expected_items, false_positive_rate);
        let hashes = Self::optimal_hashes(bits, expected_items);
        Self::new(kv, name, bits, hashes)
    }

    /// m = -n * ln(p) / (ln 2)^2
    pub fn optimal_bits(expected_items: u64, false_positive_rate: f64) -> u64 {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        (-n * p.ln() / (LN_2 * LN_2)).ceil() as u64
    }

    /// k = (m / n) * ln 2
    pub fn optimal_hashes(bits: u64, expected_items: u64) -> u32 {
        let k = (bits as f64 / expected_items.max(1) as f64) * LN_2;
        (k.round() as u32).max(1)
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn hashes(&self) -> u32 {
        self.hashes
    }

    fn positions(&self, item: &str) -> Vec<u64> {
        let digest = Sha256::digest(item.as_bytes());
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[0..8]);
        h2.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(h1);
        // Odd step keeps the index sequence from collapsing.
        let h2 = u64::from_le_bytes(h2) | 1;

        (0..self.hashes as u64)
            .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bits)
            .collect()
    }

    pub async fn add(&self, item: &str) -> Result<(), KvError> {
        self.kv.set_bits(&self.key, &self.positions(item)).await
    }

    /// `false` means definitely absent. Fails open: when the bitset cannot be
    /// read the item is reported as possibly present.
    pub async fn may_contain(&self, item: &str) -> bool {
        match self.kv.get_bits(&self.key, &self.positions(item)).await {
            Ok(bits) => bits.into_iter().all(|set| set),
            Err(err) => {
                tracing::warn!(error = %err, "bloom filter unavailable, failing open");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollcast_kv::MemoryKv;
    use std::sync::Arc;

    #[test]
    fn sizing_follows_standard_formulas() {
        let bits = BloomFilter::optimal_bits(10_000, 0.01);
        assert!((95_000..=96_500).contains(&bits), "bits = {bits}");
        assert_eq!(BloomFilter::optimal_hashes(bits, 10_000), 7);
    }

    #[tokio::test]
    async fn never_false_negative_and_bounded_false_positives() {
        let kv = Arc::new(MemoryKv::new());
        let filter = BloomFilter::with_sizing(kv, "polls", 5_000, 0.01);

        for id in 0..5_000 {
            filter.add(&format!("poll-{id}")).await.unwrap();
        }
        for id in 0..5_000 {
            assert!(filter.may_contain(&format!("poll-{id}")).await);
        }

        let mut false_positives = 0;
        let samples = 20_000;
        for id in 0..samples {
            if filter.may_contain(&format!("absent-{id}")).await {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / samples as f64;
        assert!(rate <= 0.02, "false positive rate {rate}");
    }

    #[tokio::test]
    async fn unavailable_store_fails_open() {
        let kv = Arc::new(MemoryKv::new());
        let filter = BloomFilter::with_sizing(kv.clone(), "polls", 100, 0.01);
        assert!(!filter.may_contain("never-added").await);

        kv.set_available(false);
        assert!(filter.may_contain("never-added").await);
        assert!(filter.add("x").await.is_err());
    }
}
