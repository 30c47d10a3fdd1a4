//! Shared fixtures for end-to-end runs

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use cxr_vit::{Dataset, FinetuneConfig, ModelKind, TensorDataset};

/// Spatial size of fixture images
pub const INPUT_SIZE: usize = 4;

/// Classes in fixture datasets
pub const NUM_CLASSES: usize = 4;

/// Multi-label target pattern where every class has positives and negatives
pub fn label(sample: usize, class: usize) -> f32 {
    if (sample + class) % 3 == 0 {
        1.0
    } else {
        0.0
    }
}

/// Random images with labels from `label_fn`
pub fn create_dataset(n: usize, label_fn: impl Fn(usize, usize) -> f32) -> Result<Arc<dyn Dataset>> {
    let device = Device::Cpu;
    let images = Tensor::randn(0f32, 1.0, (n, 3, INPUT_SIZE, INPUT_SIZE), &device)?;
    let targets: Vec<f32> = (0..n)
        .flat_map(|i| (0..NUM_CLASSES).map(move |c| (i, c)))
        .map(|(i, c)| label_fn(i, c))
        .collect();
    let targets = Tensor::from_vec(targets, (n, NUM_CLASSES), &device)?;
    Ok(Arc::new(TensorDataset::new(images, targets, NUM_CLASSES)?))
}

/// Images that make every forward pass non-finite
pub fn create_nan_dataset(n: usize) -> Result<Arc<dyn Dataset>> {
    let device = Device::Cpu;
    let images = Tensor::full(f32::NAN, (n, 3, INPUT_SIZE, INPUT_SIZE), &device)?;
    let targets = Tensor::zeros((n, NUM_CLASSES), candle_core::DType::F32, &device)?;
    Ok(Arc::new(TensorDataset::new(images, targets, NUM_CLASSES)?))
}

/// Small linear-probe configuration writing into `dir`
pub fn create_test_config(dir: &Path) -> FinetuneConfig {
    FinetuneConfig {
        model: ModelKind::LinearProbe,
        input_size: INPUT_SIZE,
        nb_classes: Some(NUM_CLASSES),
        batch_size: 2,
        accum_iter: 4,
        epochs: 2,
        warmup_epochs: 1.0,
        lr: Some(1e-3),
        amp: false,
        eval_interval: 1,
        print_freq: 100,
        output_dir: Some(dir.to_path_buf()),
        log_dir: Some(dir.to_path_buf()),
        ..Default::default()
    }
}

/// Flattened parameter values keyed by name, in name order
pub fn snapshot(model: &cxr_vit::Classifier) -> Result<Vec<(String, Vec<f32>)>> {
    model
        .named_vars()
        .into_iter()
        .map(|(name, var)| Ok((name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
        .collect()
}

/// Write `images` / `targets` for `n` samples of `num_classes` labels to `path`
pub fn write_dataset(path: &Path, n: usize, num_classes: usize, fill: Option<f32>) -> Result<()> {
    let device = Device::Cpu;
    let shape = (n, 3, INPUT_SIZE, INPUT_SIZE);
    let images = match fill {
        Some(value) => Tensor::full(value, shape, &device)?,
        None => Tensor::randn(0f32, 1.0, shape, &device)?,
    };
    let targets: Vec<f32> = (0..n)
        .flat_map(|i| (0..num_classes).map(move |c| label(i, c)))
        .collect();
    let targets = Tensor::from_vec(targets, (n, num_classes), &device)?;
    let tensors = std::collections::HashMap::from([
        (TensorDataset::IMAGES_KEY.to_string(), images),
        (TensorDataset::TARGETS_KEY.to_string(), targets),
    ]);
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}
