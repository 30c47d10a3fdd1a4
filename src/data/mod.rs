//! Dataset, sampler and batch loader
//!
//! Image decoding and augmentation happen upstream; datasets here serve
//! preprocessed tensors so the loop only indexes, batches and moves them.

use candle_core::{Device, Tensor};

use crate::error::Result;

pub mod concat;
pub mod dataset;
pub mod loader;
pub mod sampler;

pub use concat::ConcatDataset;
pub use dataset::TensorDataset;
pub use loader::DataLoader;
pub use sampler::DistributedSampler;

/// A batch of images with their targets
///
/// `images` is `[batch, channels, height, width]`. `targets` is either
/// `[batch, num_classes]` with {0,1} entries or `[batch]` class indices.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Input images
    pub images: Tensor,
    /// Multi-label targets or class indices
    pub targets: Tensor,
}

impl Batch {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    /// Whether the batch has no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy both tensors to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            images: self.images.to_device(device)?,
            targets: self.targets.to_device(device)?,
        })
    }
}

/// Random-access source of samples
pub trait Dataset: Send + Sync {
    /// Number of samples
    fn len(&self) -> usize;

    /// Whether the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of target classes
    fn num_classes(&self) -> usize;

    /// Gather the samples at `indices` into one batch
    fn get_batch(&self, indices: &[usize]) -> Result<Batch>;
}
