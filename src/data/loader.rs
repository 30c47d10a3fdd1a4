//! Batched iteration over a dataset shard

use std::sync::Arc;

use candle_core::Device;
use tracing::debug;

use super::{Batch, Dataset, DistributedSampler};
use crate::error::Result;

/// Loader configuration
#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    /// Samples per batch
    pub batch_size: usize,
    /// Drop the final incomplete batch
    pub drop_last: bool,
}

/// Produces device-resident batches in sampler order
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    sampler: DistributedSampler,
    config: DataLoaderConfig,
    device: Device,
}

impl DataLoader {
    /// Create a loader placing batches on `device`
    pub fn new(
        dataset: Arc<dyn Dataset>,
        sampler: DistributedSampler,
        config: DataLoaderConfig,
        device: Device,
    ) -> Self {
        debug!(
            "Creating DataLoader with batch_size={}, drop_last={}, {} samples per rank",
            config.batch_size,
            config.drop_last,
            sampler.num_samples()
        );
        Self {
            dataset,
            sampler,
            config,
            device,
        }
    }

    /// Batches per epoch
    pub fn len(&self) -> usize {
        let n = self.sampler.num_samples();
        let bs = self.config.batch_size.max(1);
        if self.config.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    /// Whether an epoch yields no batches
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Underlying dataset
    pub fn dataset(&self) -> &dyn Dataset {
        self.dataset.as_ref()
    }

    /// Sampler driving the iteration order
    pub fn sampler(&self) -> &DistributedSampler {
        &self.sampler
    }

    /// Select the shuffle permutation for `epoch`
    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    /// Iterate one epoch of batches
    pub fn iter(&self) -> BatchIter<'_> {
        let bs = self.config.batch_size.max(1);
        let mut chunks: Vec<Vec<usize>> = self.sampler.indices().chunks(bs).map(<[usize]>::to_vec).collect();
        if self.config.drop_last && chunks.last().is_some_and(|c| c.len() < bs) {
            chunks.pop();
        }
        BatchIter {
            loader: self,
            chunks: chunks.into_iter(),
        }
    }
}

/// Iterator returned by [`DataLoader::iter`]
pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    chunks: std::vec::IntoIter<Vec<usize>>,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.chunks.next()?;
        Some(
            self.loader
                .dataset
                .get_batch(&indices)
                .and_then(|batch| batch.to_device(&self.loader.device)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for BatchIter<'_> {}
