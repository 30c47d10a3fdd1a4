//! Rank-aware index sampling

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits a dataset into one disjoint shard per worker
///
/// The index list is padded by wrapping around so every rank receives the
/// same number of samples, then strided by rank. Shuffling is seeded by
/// `seed + epoch`, so all ranks agree on the permutation without
/// communicating.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    /// Create a sampler for `rank` out of `num_replicas`
    pub fn new(dataset_len: usize, num_replicas: usize, rank: usize, shuffle: bool, seed: u64) -> Self {
        let num_replicas = num_replicas.max(1);
        Self {
            dataset_len,
            num_replicas,
            rank: rank.min(num_replicas - 1),
            shuffle,
            seed,
            epoch: 0,
        }
    }

    /// In-order sampler over the whole dataset
    pub fn sequential(dataset_len: usize) -> Self {
        Self::new(dataset_len, 1, 0, false, 0)
    }

    /// Select the permutation for the coming epoch
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch as u64;
    }

    /// Samples assigned to this rank per epoch
    pub fn num_samples(&self) -> usize {
        self.dataset_len.div_ceil(self.num_replicas)
    }

    /// Padded length across all ranks
    pub fn total_size(&self) -> usize {
        self.num_samples() * self.num_replicas
    }

    /// Number of ranks
    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Indices for this rank in iteration order
    pub fn indices(&self) -> Vec<usize> {
        if self.dataset_len == 0 {
            return Vec::new();
        }

        let mut indices: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            indices.shuffle(&mut rng);
        }

        let total = self.total_size();
        let mut i = 0;
        while indices.len() < total {
            indices.push(indices[i]);
            i += 1;
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shards_are_disjoint_and_cover() {
        let shards: Vec<Vec<usize>> = (0..3)
            .map(|rank| {
                let mut s = DistributedSampler::new(10, 3, rank, true, 7);
                s.set_epoch(2);
                s.indices()
            })
            .collect();

        for shard in &shards {
            assert_eq!(shard.len(), 4);
        }
        let covered: HashSet<usize> = shards.iter().flatten().copied().collect();
        assert_eq!(covered.len(), 10);
    }

    #[test]
    fn test_sequential_is_identity() {
        assert_eq!(DistributedSampler::sequential(4).indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unshuffled_stride_with_padding() {
        let s = DistributedSampler::new(5, 2, 1, false, 0);
        assert_eq!(s.indices(), vec![1, 3, 0]);
    }

    #[test]
    fn test_epoch_changes_permutation() {
        let mut s = DistributedSampler::new(64, 1, 0, true, 0);
        let a = s.indices();
        assert_eq!(a, s.indices());
        s.set_epoch(1);
        assert_ne!(a, s.indices());
    }
}
