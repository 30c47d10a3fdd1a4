//! In-memory tensor dataset

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use super::{Batch, Dataset};
use crate::error::{Error, Result};

/// Samples held as two stacked tensors
#[derive(Debug, Clone)]
pub struct TensorDataset {
    images: Tensor,
    targets: Tensor,
    num_classes: usize,
}

impl TensorDataset {
    /// Key of the image tensor in a dataset file
    pub const IMAGES_KEY: &'static str = "images";
    /// Key of the target tensor in a dataset file
    pub const TARGETS_KEY: &'static str = "targets";

    /// Wrap image and target tensors
    ///
    /// Targets are `[n, num_classes]` multi-label rows or `[n]` class indices.
    pub fn new(images: Tensor, targets: Tensor, num_classes: usize) -> Result<Self> {
        let images_dims = images.dims();
        if images_dims.len() != 4 {
            return Err(Error::data(format!(
                "images must be [n, c, h, w], got {:?}",
                images_dims
            )));
        }
        let n = images_dims[0];

        let targets = match targets.dims() {
            [m] if *m == n => targets.to_dtype(DType::U32)?,
            [m, k] if *m == n && *k == num_classes => targets.to_dtype(DType::F32)?,
            dims => {
                return Err(Error::data(format!(
                    "targets must be [{}] or [{}, {}], got {:?}",
                    n, n, num_classes, dims
                )))
            }
        };

        Ok(Self {
            images: images.to_dtype(DType::F32)?,
            targets,
            num_classes,
        })
    }

    /// Load `images` / `targets` from a safetensors file
    pub fn from_safetensors(path: impl AsRef<Path>, num_classes: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let images = tensors.remove(Self::IMAGES_KEY).ok_or_else(|| {
            Error::data(format!("{} has no '{}' tensor", path.display(), Self::IMAGES_KEY))
        })?;
        let targets = tensors.remove(Self::TARGETS_KEY).ok_or_else(|| {
            Error::data(format!("{} has no '{}' tensor", path.display(), Self::TARGETS_KEY))
        })?;

        let dataset = Self::new(images, targets, num_classes)?;
        info!("Loaded {} samples from {}", dataset.len(), path.display());
        Ok(dataset)
    }

    /// Normalize each channel as `(x - mean) / std`
    pub fn normalized(self, mean: [f32; 3], std: [f32; 3]) -> Result<Self> {
        let channels = self.images.dim(1)?;
        if channels != 3 {
            return Err(Error::data(format!("normalization expects 3 channels, got {}", channels)));
        }
        let device = self.images.device();
        let mean = Tensor::new(&mean, device)?.reshape((1, 3, 1, 1))?;
        let std = Tensor::new(&std, device)?.reshape((1, 3, 1, 1))?;
        let images = self.images.broadcast_sub(&mean)?.broadcast_div(&std)?;
        Ok(Self { images, ..self })
    }

    /// Whether targets are class indices rather than multi-label rows
    pub fn has_class_indices(&self) -> bool {
        self.targets.rank() == 1
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.images.dims()[0]
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn get_batch(&self, indices: &[usize]) -> Result<Batch> {
        let n = self.len();
        if let Some(&bad) = indices.iter().find(|&&i| i >= n) {
            return Err(Error::data(format!("sample index {} out of range for {} samples", bad, n)));
        }
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::new(idx.as_slice(), self.images.device())?;
        Ok(Batch {
            images: self.images.index_select(&idx, 0)?,
            targets: self.targets.index_select(&idx, 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> TensorDataset {
        let images = Tensor::arange(0f32, 5.0 * 3.0 * 2.0 * 2.0, &Device::Cpu)
            .unwrap()
            .reshape((5, 3, 2, 2))
            .unwrap();
        let targets = Tensor::new(&[0u32, 1, 2, 1, 0], &Device::Cpu).unwrap();
        TensorDataset::new(images, targets, 3).unwrap()
    }

    #[test]
    fn test_get_batch_selects_rows() {
        let ds = toy();
        let batch = ds.get_batch(&[4, 1]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.targets.to_vec1::<u32>().unwrap(), vec![0, 1]);
        let first: f32 = batch.images.get(0).unwrap().flatten_all().unwrap().get(0).unwrap().to_scalar().unwrap();
        assert_eq!(first, 48.0);
        assert!(ds.has_class_indices());
        assert!(ds.get_batch(&[5]).is_err());
    }

    #[test]
    fn test_shape_validation() {
        let images = Tensor::zeros((4, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(TensorDataset::new(images.clone(), targets.clone(), 3).is_err());
        assert!(TensorDataset::new(images, targets, 2).is_ok());
    }

    #[test]
    fn test_normalization() {
        let images = Tensor::ones((1, 3, 1, 1), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        let ds = TensorDataset::new(images, targets, 2)
            .unwrap()
            .normalized([0.5, 0.5, 0.5], [0.25, 0.5, 1.0])
            .unwrap();
        let values: Vec<f32> = ds.get_batch(&[0]).unwrap().images.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![2.0, 1.0, 0.5]);
    }

    #[test]
    fn test_safetensors_roundtrip_and_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.safetensors");
        let images = Tensor::zeros((2, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        candle_core::safetensors::save(
            &std::collections::HashMap::from([
                ("images".to_string(), images.clone()),
                ("targets".to_string(), targets),
            ]),
            &path,
        )
        .unwrap();
        let ds = TensorDataset::from_safetensors(&path, 4).unwrap();
        assert_eq!(ds.len(), 2);

        let bad = dir.path().join("bad.safetensors");
        candle_core::safetensors::save(&std::collections::HashMap::from([("images".to_string(), images)]), &bad).unwrap();
        assert!(matches!(TensorDataset::from_safetensors(&bad, 4), Err(Error::Data(_))));
    }
}
