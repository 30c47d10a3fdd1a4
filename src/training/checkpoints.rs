//! Checkpoint persistence, resume and fine-tune initialization
//!
//! A checkpoint is written whole to a temporary file, synced, then renamed
//! over its final name, so `checkpoint-latest.bin` always names a complete
//! file. Resume is strict; fine-tune loading is partial and never fails on
//! a single mismatched key.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CheckpointType;
use crate::error::{Error, Result};
use crate::model::Classifier;
use crate::training::optimizers::{AdamW, AdamWState, LossScaler, LossScalerState};

/// Checkpoint file layout version
pub const CHECKPOINT_VERSION: u32 = 1;

/// File name of the rolling checkpoint
pub const LATEST_CHECKPOINT: &str = "checkpoint-latest.bin";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const SMP_ENCODER_PREFIX: &str = "model.encoder.";

/// ViT position embedding, `[1, 1 + grid * grid, hidden]`
pub const POS_EMBED_KEY: &str = "vit.embeddings.position_embeddings";

/// One named tensor, stored row-major as f32
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    /// Parameter name
    pub name: String,
    /// Shape
    pub shape: Vec<usize>,
    /// Values
    pub data: Vec<f32>,
}

impl TensorRecord {
    fn from_tensor(name: String, tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            name,
            shape: tensor.dims().to_vec(),
            data: tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?,
        })
    }

    fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.data, self.shape.as_slice(), device)?)
    }
}

/// Persisted training state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Layout version
    pub version: u32,
    /// Last completed epoch
    pub epoch: usize,
    /// Model parameters sorted by name
    pub model: Vec<TensorRecord>,
    /// Optimizer state
    pub optimizer: Option<AdamWState>,
    /// Loss scaler state
    pub scaler: Option<LossScalerState>,
    /// Resolved configuration as JSON
    pub config: String,
}

impl Checkpoint {
    /// Snapshot the current run state
    pub fn capture(
        epoch: usize,
        model: &Classifier,
        optimizer: &AdamW,
        scaler: &LossScaler,
        config_json: String,
    ) -> Result<Self> {
        let records = model
            .named_vars()
            .into_iter()
            .map(|(name, var)| TensorRecord::from_tensor(name, var.as_tensor()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            version: CHECKPOINT_VERSION,
            epoch,
            model: records,
            optimizer: Some(optimizer.state_dict()?),
            scaler: Some(scaler.state_dict()),
            config: config_json,
        })
    }

    /// Model weights as tensors keyed by name
    pub fn model_tensors(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        self.model
            .iter()
            .map(|r| -> Result<(String, Tensor)> { Ok((r.name.clone(), r.to_tensor(device)?)) })
            .collect()
    }
}

/// Write `checkpoint-<epoch>.bin` and refresh `checkpoint-latest.bin`
pub fn save_checkpoint(dir: &Path, checkpoint: &Checkpoint, compress: bool) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let bytes = encode(checkpoint, compress)?;

    let path = dir.join(format!("checkpoint-{}.bin", checkpoint.epoch));
    write_atomic(&path, &bytes)?;
    write_atomic(&dir.join(LATEST_CHECKPOINT), &bytes)?;

    info!("Saved checkpoint for epoch {} to {}", checkpoint.epoch, path.display());
    Ok(path)
}

/// Read a checkpoint written by [`save_checkpoint`], compressed or not
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let mut raw = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut raw)?;

    let bytes = if raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        out
    } else {
        raw
    };

    let checkpoint: Checkpoint = bincode::deserialize(&bytes)?;
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(Error::checkpoint(format!(
            "{} has layout version {}, expected {}",
            path.display(),
            checkpoint.version,
            CHECKPOINT_VERSION
        )));
    }
    Ok(checkpoint)
}

fn encode(checkpoint: &Checkpoint, compress: bool) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(checkpoint)?;
    if !compress {
        return Ok(bytes);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes)?;
    Ok(encoder.finish()?)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::checkpoint(format!("invalid checkpoint path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Restore model, optimizer and scaler; returns the next epoch to run
///
/// Every model parameter must be present with a matching shape.
pub fn resume_from(
    checkpoint: &Checkpoint,
    model: &Classifier,
    optimizer: Option<&mut AdamW>,
    scaler: Option<&mut LossScaler>,
) -> Result<usize> {
    let device = model_device(model);
    let saved = checkpoint.model_tensors(&device)?;
    let vars = model.named_vars();

    for (name, _) in &vars {
        if !saved.contains_key(name) {
            return Err(Error::checkpoint(format!("checkpoint is missing parameter '{}'", name)));
        }
    }
    for (name, var) in &vars {
        let value = &saved[name];
        if value.dims() != var.as_tensor().dims() {
            return Err(Error::checkpoint(format!(
                "shape mismatch for '{}': model {:?}, checkpoint {:?}",
                name,
                var.as_tensor().dims(),
                value.dims()
            )));
        }
        var.set(&value.to_dtype(var.as_tensor().dtype())?)?;
    }
    if saved.len() != vars.len() {
        warn!("checkpoint has {} entries not present in the model", saved.len() - vars.len());
    }

    if let Some(optimizer) = optimizer {
        match &checkpoint.optimizer {
            Some(state) => optimizer.load_state_dict(state, &device)?,
            None => warn!("checkpoint has no optimizer state"),
        }
    }
    if let Some(scaler) = scaler {
        match &checkpoint.scaler {
            Some(state) => scaler.load_state_dict(state),
            None => warn!("checkpoint has no loss scaler state"),
        }
    }

    info!("Resumed from epoch {}", checkpoint.epoch);
    Ok(checkpoint.epoch + 1)
}

/// Outcome of a partial weight load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Keys copied into the model
    pub loaded: Vec<String>,
    /// Keys present in both with different shapes
    pub shape_mismatch: Vec<String>,
    /// Checkpoint keys with no model parameter of that name
    pub unexpected: Vec<String>,
    /// Model parameters not supplied by the checkpoint
    pub missing: Vec<String>,
}

/// Initialize `model` from pre-trained weights
///
/// Accepts a `.safetensors` file or a checkpoint written by this crate.
/// Only entries whose name and shape both match are copied.
pub fn load_finetune_weights(
    path: &Path,
    model: &Classifier,
    checkpoint_type: Option<CheckpointType>,
    keywords: Option<&[String]>,
) -> Result<LoadReport> {
    info!("Load pre-trained checkpoint from: {}", path.display());
    let device = model_device(model);
    let weights = if path.extension().is_some_and(|e| e == "safetensors") {
        candle_core::safetensors::load(path, &device)?
    } else {
        load_checkpoint(path)?.model_tensors(&device)?
    };
    load_weights(weights, model, checkpoint_type, keywords)
}

/// Copy matching entries of `weights` into `model`
pub fn load_weights(
    weights: HashMap<String, Tensor>,
    model: &Classifier,
    checkpoint_type: Option<CheckpointType>,
    keywords: Option<&[String]>,
) -> Result<LoadReport> {
    let weights: HashMap<String, Tensor> = match checkpoint_type {
        Some(CheckpointType::SmpEncoder) => weights
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(SMP_ENCODER_PREFIX).map(|s| (s.to_string(), v)))
            .collect(),
        None => weights,
    };

    let mut weights = weights;
    let vars: HashMap<String, candle_core::Var> = model.named_vars().into_iter().collect();
    if let (Some(saved), Some(var)) = (weights.get(POS_EMBED_KEY), vars.get(POS_EMBED_KEY)) {
        if let Some(resized) = interpolate_pos_embed(saved, var.as_tensor().dims())? {
            weights.insert(POS_EMBED_KEY.to_string(), resized);
        }
    }
    let mut report = LoadReport::default();

    let mut keys: Vec<&String> = weights.keys().collect();
    keys.sort();
    for key in keys {
        if let Some(keywords) = keywords {
            if !keywords.iter().any(|kw| key.contains(kw.as_str())) {
                continue;
            }
        }
        let value = &weights[key];
        match vars.get(key) {
            None => {
                warn!("{} not found in init model", key);
                report.unexpected.push(key.clone());
            }
            Some(var) if var.as_tensor().dims() != value.dims() => {
                warn!(
                    "Shape of {} doesn't match: model {:?}, checkpoint {:?}",
                    key,
                    var.as_tensor().dims(),
                    value.dims()
                );
                report.shape_mismatch.push(key.clone());
            }
            Some(var) => {
                var.set(&value.to_dtype(var.as_tensor().dtype())?)?;
                debug!("Loaded {} from saved weights", key);
                report.loaded.push(key.clone());
            }
        }
    }

    let mut missing: Vec<String> = vars
        .keys()
        .filter(|k| !report.loaded.contains(k))
        .cloned()
        .collect();
    missing.sort();
    report.missing = missing;

    info!(
        "Loaded {} tensors ({} shape mismatches, {} unexpected, {} missing)",
        report.loaded.len(),
        report.shape_mismatch.len(),
        report.unexpected.len(),
        report.missing.len()
    );
    Ok(report)
}

/// Resize a position embedding to the model's patch grid
///
/// The leading class-token row is kept and the square grid of patch rows
/// is resampled bilinearly (half-pixel centers). Returns `None` when the
/// shapes already agree or cannot be reconciled.
pub fn interpolate_pos_embed(saved: &Tensor, target: &[usize]) -> Result<Option<Tensor>> {
    let (src_tokens, dst_tokens, dim) = match (saved.dims(), target) {
        ([1, n, d], [1, m, e]) if d == e => (*n, *m, *d),
        _ => return Ok(None),
    };
    if src_tokens == dst_tokens {
        return Ok(None);
    }
    let (Some(src_grid), Some(dst_grid)) = (square_grid(src_tokens), square_grid(dst_tokens)) else {
        warn!(
            "Cannot interpolate position embedding from {} to {} tokens",
            src_tokens, dst_tokens
        );
        return Ok(None);
    };
    info!(
        "Position interpolate from {}x{} to {}x{}",
        src_grid, src_grid, dst_grid, dst_grid
    );

    let device = saved.device();
    let saved = saved.to_dtype(DType::F32)?;
    let cls = saved.narrow(1, 0, 1)?;
    // [d, g, g] with rows of the grid along dim 1
    let grid = saved
        .narrow(1, 1, src_grid * src_grid)?
        .reshape((src_grid, src_grid, dim))?
        .permute((2, 0, 1))?
        .contiguous()?;

    let weights = Tensor::from_vec(resize_weights(src_grid, dst_grid), (dst_grid, src_grid), device)?;
    let weights_t = weights.t()?.contiguous()?;
    // resample columns, then rows
    let cols = grid
        .reshape((dim * src_grid, src_grid))?
        .matmul(&weights_t)?
        .reshape((dim, src_grid, dst_grid))?
        .transpose(1, 2)?
        .contiguous()?;
    let resized = cols
        .reshape((dim * dst_grid, src_grid))?
        .matmul(&weights_t)?
        .reshape((dim, dst_grid, dst_grid))?
        .transpose(1, 2)?
        .contiguous()?;

    let patches = resized
        .reshape((dim, dst_grid * dst_grid))?
        .t()?
        .unsqueeze(0)?;
    Ok(Some(Tensor::cat(&[&cls, &patches], 1)?.contiguous()?))
}

fn square_grid(tokens: usize) -> Option<usize> {
    let patches = tokens.checked_sub(1)?;
    let side = (patches as f64).sqrt().round() as usize;
    (side > 0 && side * side == patches).then_some(side)
}

/// Row-major `[to, from]` bilinear interpolation matrix
fn resize_weights(from: usize, to: usize) -> Vec<f32> {
    let mut weights = vec![0f32; to * from];
    let scale = from as f64 / to as f64;
    for i in 0..to {
        let src = ((i as f64 + 0.5) * scale - 0.5).clamp(0.0, (from - 1) as f64);
        let lo = src.floor() as usize;
        let hi = (lo + 1).min(from - 1);
        let frac = (src - lo as f64) as f32;
        weights[i * from + lo] += 1.0 - frac;
        weights[i * from + hi] += frac;
    }
    weights
}

fn model_device(model: &Classifier) -> Device {
    model
        .named_vars()
        .first()
        .map(|(_, v)| v.as_tensor().device().clone())
        .unwrap_or(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelKind;
    use crate::training::optimizers::{add_weight_decay, AdamWParams};

    fn model() -> Classifier {
        Classifier::new(ModelKind::LinearProbe, 2, 2, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_save_load_roundtrip_compressed_and_plain() {
        let dir = tempfile::tempdir().unwrap();
        let m = model();
        let opt = AdamW::new(add_weight_decay(&m, 0.05, &[], &[]), 1e-3, AdamWParams::default());
        let scaler = LossScaler::new(true);

        for compress in [false, true] {
            let ckpt = Checkpoint::capture(3, &m, &opt, &scaler, "{}".to_string()).unwrap();
            let path = save_checkpoint(dir.path(), &ckpt, compress).unwrap();
            assert_eq!(path.file_name().unwrap(), "checkpoint-3.bin");

            let loaded = load_checkpoint(&dir.path().join(LATEST_CHECKPOINT)).unwrap();
            assert_eq!(loaded.epoch, 3);
            assert_eq!(loaded.model, ckpt.model);
            assert_eq!(loaded.scaler, ckpt.scaler);
        }
        // no temporary files remain
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_resume_restores_weights_and_epoch() {
        let source = model();
        let opt = AdamW::new(add_weight_decay(&source, 0.05, &[], &[]), 1e-3, AdamWParams::default());
        let ckpt = Checkpoint::capture(7, &source, &opt, &LossScaler::new(true), String::new()).unwrap();

        let target = model();
        let mut target_opt = AdamW::new(add_weight_decay(&target, 0.05, &[], &[]), 1e-3, AdamWParams::default());
        let next = resume_from(&ckpt, &target, Some(&mut target_opt), None).unwrap();
        assert_eq!(next, 8);

        let a = source.state_dict();
        let b = target.state_dict();
        for (name, t) in &a {
            assert_eq!(
                t.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                b[name].flatten_all().unwrap().to_vec1::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn test_resume_is_strict_on_shape() {
        let other = Classifier::new(ModelKind::LinearProbe, 3, 2, &Device::Cpu).unwrap();
        let opt = AdamW::new(add_weight_decay(&other, 0.0, &[], &[]), 1e-3, AdamWParams::default());
        let ckpt = Checkpoint::capture(0, &other, &opt, &LossScaler::new(false), String::new()).unwrap();
        assert!(matches!(resume_from(&ckpt, &model(), None, None), Err(Error::Checkpoint(_))));
    }

    #[test]
    fn test_partial_load_skips_mismatches() {
        let m = model();
        let weights = HashMap::from([
            ("head.weight".to_string(), Tensor::ones((2, 12), DType::F32, &Device::Cpu).unwrap()),
            ("head.bias".to_string(), Tensor::ones(5, DType::F32, &Device::Cpu).unwrap()),
            ("pos_embed".to_string(), Tensor::ones(3, DType::F32, &Device::Cpu).unwrap()),
        ]);
        let report = load_weights(weights, &m, None, None).unwrap();
        assert_eq!(report.loaded, vec!["head.weight".to_string()]);
        assert_eq!(report.shape_mismatch, vec!["head.bias".to_string()]);
        assert_eq!(report.unexpected, vec!["pos_embed".to_string()]);
        assert_eq!(report.missing, vec!["head.bias".to_string()]);

        let w: Vec<f32> = m.state_dict()["head.weight"].flatten_all().unwrap().to_vec1().unwrap();
        assert!(w.iter().all(|&x| x == 1.0));
    }

    #[test]
    fn test_smp_encoder_prefix_and_keywords() {
        let m = model();
        let weights = HashMap::from([
            ("model.encoder.head.weight".to_string(), Tensor::ones((2, 12), DType::F32, &Device::Cpu).unwrap()),
            ("model.encoder.head.bias".to_string(), Tensor::ones(2, DType::F32, &Device::Cpu).unwrap()),
            ("model.decoder.x".to_string(), Tensor::ones(2, DType::F32, &Device::Cpu).unwrap()),
        ]);
        let keywords = vec!["bias".to_string()];
        let report = load_weights(weights, &m, Some(CheckpointType::SmpEncoder), Some(&keywords)).unwrap();
        assert_eq!(report.loaded, vec!["head.bias".to_string()]);
        assert!(report.unexpected.is_empty());
    }

    #[test]
    fn test_interpolate_keeps_cls_row_and_constant_grid() {
        let cls = Tensor::full(7f32, (1, 1, 3), &Device::Cpu).unwrap();
        let grid = Tensor::full(2f32, (1, 4, 3), &Device::Cpu).unwrap();
        let saved = Tensor::cat(&[&cls, &grid], 1).unwrap();

        let resized = interpolate_pos_embed(&saved, &[1, 17, 3]).unwrap().unwrap();
        assert_eq!(resized.dims(), &[1, 17, 3]);
        let rows: Vec<Vec<f32>> = resized.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0], vec![7.0; 3]);
        for row in &rows[1..] {
            for v in row {
                assert!((v - 2.0).abs() < 1e-6);
            }
        }

        assert!(interpolate_pos_embed(&saved, &[1, 5, 3]).unwrap().is_none());
        assert!(interpolate_pos_embed(&saved, &[1, 8, 3]).unwrap().is_none());
        assert!(interpolate_pos_embed(&saved, &[1, 17, 4]).unwrap().is_none());
    }

    #[test]
    fn test_interpolate_preserves_axis_order() {
        // 2x2 grid varying only along columns: [[0, 1], [0, 1]]
        let values = vec![0f32, 0.0, 1.0, 0.0, 1.0];
        let saved = Tensor::from_vec(values, (1, 5, 1), &Device::Cpu).unwrap();
        let resized = interpolate_pos_embed(&saved, &[1, 17, 1]).unwrap().unwrap();
        let flat: Vec<f32> = resized.flatten_all().unwrap().to_vec1().unwrap();
        let grid = &flat[1..];
        for r in 0..4 {
            let row = &grid[r * 4..(r + 1) * 4];
            assert_eq!(row, &grid[0..4]);
            assert!(row.windows(2).all(|w| w[0] <= w[1]));
        }
        assert_eq!(grid[0], 0.0);
        assert_eq!(grid[3], 1.0);
    }

    #[test]
    fn test_vit_load_interpolates_position_embedding() {
        // 64 px at patch 16 is a 4x4 grid; the saved embedding comes from a 2x2 grid
        let vit = Classifier::new(ModelKind::VitTinyPatch16, 2, 64, &Device::Cpu).unwrap();
        let target = vit.state_dict()[POS_EMBED_KEY].dims().to_vec();
        assert_eq!(target, vec![1, 17, 192]);

        let weights = HashMap::from([(
            POS_EMBED_KEY.to_string(),
            Tensor::ones((1, 5, 192), DType::F32, &Device::Cpu).unwrap(),
        )]);
        let report = load_weights(weights, &vit, None, None).unwrap();
        assert_eq!(report.loaded, vec![POS_EMBED_KEY.to_string()]);
        assert!(report.shape_mismatch.is_empty());

        let loaded: Vec<f32> = vit.state_dict()[POS_EMBED_KEY].flatten_all().unwrap().to_vec1().unwrap();
        assert!(loaded.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }
}
