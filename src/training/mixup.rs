//! Mixup / CutMix label-mixing augmentation
//!
//! Batch mode only: one mixing coefficient and one box are drawn per
//! batch, and every sample is paired with its mirror in the reversed batch.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution};
use tracing::trace;

use crate::config::MixupConfig;
use crate::data::Batch;
use crate::error::{Error, Result};

/// Cutmix box as `(y_lo, y_hi, x_lo, x_hi)`, half-open
pub type BBox = (usize, usize, usize, usize);

/// Stateful batch mixer
#[derive(Debug, Clone)]
pub struct Mixup {
    config: MixupConfig,
    cutmix_alpha: f64,
    smoothing: f64,
    num_classes: usize,
    rng: StdRng,
}

impl Mixup {
    /// Build a mixer, or `None` when neither mixup nor cutmix is enabled
    pub fn from_config(config: &MixupConfig, smoothing: f64, num_classes: usize, seed: u64) -> Option<Self> {
        if !config.is_active() {
            return None;
        }
        // A box range replaces the Beta draw for cutmix sizes.
        let cutmix_alpha = if config.cutmix_minmax.is_some() { 1.0 } else { config.cutmix };
        Some(Self {
            config: config.clone(),
            cutmix_alpha,
            smoothing,
            num_classes,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Draw `(lambda, use_cutmix)` for one batch
    fn params_per_batch(&mut self) -> Result<(f64, bool)> {
        if self.rng.random::<f64>() >= self.config.prob {
            return Ok((1.0, false));
        }
        let mixup_alpha = self.config.mixup;
        let (alpha, use_cutmix) = if mixup_alpha > 0.0 && self.cutmix_alpha > 0.0 {
            if self.rng.random::<f64>() < self.config.switch_prob {
                (self.cutmix_alpha, true)
            } else {
                (mixup_alpha, false)
            }
        } else if mixup_alpha > 0.0 {
            (mixup_alpha, false)
        } else {
            (self.cutmix_alpha, true)
        };
        let beta = Beta::new(alpha, alpha).map_err(|e| Error::config(format!("invalid mixup alpha {}: {}", alpha, e)))?;
        Ok((beta.sample(&mut self.rng), use_cutmix))
    }

    /// Draw a box covering roughly `1 - lam` of the image
    ///
    /// Returns the box and the coefficient corrected to its actual area.
    pub fn cutmix_bbox_and_lam(&mut self, height: usize, width: usize, lam: f64) -> (BBox, f64) {
        let bbox = match self.config.cutmix_minmax {
            Some((lo, hi)) => {
                let cut_h = self.rand_between((height as f64 * lo) as usize, (height as f64 * hi) as usize);
                let cut_w = self.rand_between((width as f64 * lo) as usize, (width as f64 * hi) as usize);
                let yl = self.rng.random_range(0..=height.saturating_sub(cut_h));
                let xl = self.rng.random_range(0..=width.saturating_sub(cut_w));
                (yl, (yl + cut_h).min(height), xl, (xl + cut_w).min(width))
            }
            None => {
                let ratio = (1.0 - lam).max(0.0).sqrt();
                let cut_h = (height as f64 * ratio) as usize;
                let cut_w = (width as f64 * ratio) as usize;
                let cy = self.rng.random_range(0..height.max(1));
                let cx = self.rng.random_range(0..width.max(1));
                (
                    cy.saturating_sub(cut_h / 2),
                    (cy + cut_h / 2).min(height),
                    cx.saturating_sub(cut_w / 2),
                    (cx + cut_w / 2).min(width),
                )
            }
        };
        let (yl, yh, xl, xh) = bbox;
        let area = ((yh - yl) * (xh - xl)) as f64;
        (bbox, 1.0 - area / (height * width) as f64)
    }

    fn rand_between(&mut self, lo: usize, hi: usize) -> usize {
        if hi <= lo {
            lo
        } else {
            self.rng.random_range(lo..hi)
        }
    }

    /// Mix a batch, returning mixed images and soft targets
    pub fn apply(&mut self, batch: &Batch) -> Result<Batch> {
        let n = batch.len();
        if n % 2 != 0 {
            return Err(Error::data(format!("mixup requires an even batch size, got {}", n)));
        }
        let (lam, use_cutmix) = self.params_per_batch()?;
        let device = batch.images.device();
        let reversed = reversed_index(n, device)?;
        let flipped = batch.images.index_select(&reversed, 0)?;

        let (images, lam) = if lam >= 1.0 {
            (batch.images.clone(), 1.0)
        } else if use_cutmix {
            let (_, _, h, w) = batch.images.dims4()?;
            let (bbox, lam) = self.cutmix_bbox_and_lam(h, w, lam);
            trace!("cutmix box {:?}, lambda {:.4}", bbox, lam);
            let mask = box_mask(h, w, bbox, device)?.to_dtype(batch.images.dtype())?;
            let keep = mask.affine(-1.0, 1.0)?;
            let mixed = (batch.images.broadcast_mul(&keep)? + flipped.broadcast_mul(&mask)?)?;
            (mixed, lam)
        } else {
            trace!("mixup lambda {:.4}", lam);
            let mixed = (batch.images.affine(lam, 0.0)? + flipped.affine(1.0 - lam, 0.0)?)?;
            (mixed, lam)
        };

        let targets = self.mixup_target(&batch.targets, lam)?;
        Ok(Batch { images, targets })
    }

    /// Smoothed targets blended with the reversed batch's targets
    pub fn mixup_target(&self, targets: &Tensor, lam: f64) -> Result<Tensor> {
        let off = self.smoothing / self.num_classes as f64;
        let on = 1.0 - self.smoothing + off;
        let y = smooth_targets(targets, self.num_classes, on, off)?;
        let reversed = reversed_index(y.dim(0)?, y.device())?;
        let y_flipped = y.index_select(&reversed, 0)?;
        Ok((y.affine(lam, 0.0)? + y_flipped.affine(1.0 - lam, 0.0)?)?)
    }
}

fn reversed_index(n: usize, device: &Device) -> Result<Tensor> {
    let idx: Vec<u32> = (0..n as u32).rev().collect();
    Ok(Tensor::new(idx.as_slice(), device)?)
}

/// `[1, 1, h, w]` tensor with ones inside `bbox`
fn box_mask(height: usize, width: usize, bbox: BBox, device: &Device) -> Result<Tensor> {
    let (yl, yh, xl, xh) = bbox;
    let mut mask = vec![0f32; height * width];
    for y in yl..yh {
        for x in xl..xh {
            mask[y * width + x] = 1.0;
        }
    }
    Ok(Tensor::from_vec(mask, (1, 1, height, width), device)?)
}

/// Map hard targets to `on` / `off` values
///
/// Accepts `[n]` class indices or `[n, c]` multi-label rows.
fn smooth_targets(targets: &Tensor, num_classes: usize, on: f64, off: f64) -> Result<Tensor> {
    let dense = if targets.rank() == 1 {
        let indices = targets.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let rows = crate::training::auroc::one_hot(&indices, num_classes)?;
        Tensor::from_vec(rows.iter().copied().collect::<Vec<f32>>(), rows.dim(), targets.device())?
    } else {
        targets.to_dtype(DType::F32)?
    };
    Ok(dense.affine(on - off, off)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mixer(mixup: f64, cutmix: f64, minmax: Option<(f64, f64)>) -> Mixup {
        let config = MixupConfig {
            mixup,
            cutmix,
            cutmix_minmax: minmax,
            ..Default::default()
        };
        Mixup::from_config(&config, 0.1, 4, 0).unwrap()
    }

    #[test]
    fn test_inactive_config_builds_nothing() {
        assert!(Mixup::from_config(&MixupConfig::default(), 0.1, 4, 0).is_none());
    }

    #[test]
    fn test_target_smoothing_and_mixing() {
        let m = mixer(0.8, 0.0, None);
        let targets = Tensor::new(&[0u32, 3], &Device::Cpu).unwrap();
        let mixed: Vec<Vec<f32>> = m.mixup_target(&targets, 0.7).unwrap().to_vec2().unwrap();
        // off = 0.025, on = 0.925
        assert_relative_eq!(mixed[0][0], 0.7 * 0.925 + 0.3 * 0.025, epsilon = 1e-6);
        assert_relative_eq!(mixed[0][3], 0.7 * 0.025 + 0.3 * 0.925, epsilon = 1e-6);
        assert_relative_eq!(mixed[1][1], 0.025, epsilon = 1e-6);
        for row in &mixed {
            assert_relative_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_cutmix_lambda_matches_box_area() {
        let mut m = mixer(0.0, 1.0, None);
        for _ in 0..20 {
            let ((yl, yh, xl, xh), lam) = m.cutmix_bbox_and_lam(16, 16, 0.6);
            assert!(yl <= yh && yh <= 16 && xl <= xh && xh <= 16);
            assert_relative_eq!(lam, 1.0 - ((yh - yl) * (xh - xl)) as f64 / 256.0);
        }
    }

    #[test]
    fn test_cutmix_minmax_box_size() {
        let mut m = mixer(0.0, 0.0, Some((0.25, 0.5)));
        for _ in 0..20 {
            let ((yl, yh, xl, xh), _) = m.cutmix_bbox_and_lam(16, 16, 0.5);
            assert!((4..8).contains(&(yh - yl)));
            assert!((4..8).contains(&(xh - xl)));
        }
    }

    #[test]
    fn test_apply_preserves_shapes_and_mass() {
        let mut m = mixer(1.0, 1.0, None);
        let images = Tensor::ones((4, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1f32, 0., 0., 1.], [0., 1., 0., 0.], [0., 0., 1., 0.], [1., 1., 0., 0.]], &Device::Cpu).unwrap();
        let batch = Batch { images, targets };
        let mixed = m.apply(&batch).unwrap();
        assert_eq!(mixed.images.dims(), &[4, 3, 8, 8]);
        assert_eq!(mixed.targets.dims(), &[4, 4]);
        // mixing all-ones images yields all ones
        let total: f32 = mixed.images.sum_all().unwrap().to_scalar().unwrap();
        assert_relative_eq!(total, 4.0 * 3.0 * 64.0, epsilon = 1e-3);

        let odd = Batch {
            images: Tensor::ones((3, 3, 8, 8), DType::F32, &Device::Cpu).unwrap(),
            targets: Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap(),
        };
        assert!(m.apply(&odd).is_err());
    }
}
