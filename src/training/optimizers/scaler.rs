//! Dynamic loss scaling and gradient-norm clipping

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Gradients;
use crate::error::Result;

/// Saved loss-scaler state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScalerState {
    /// Current scale
    pub scale: f64,
    /// Consecutive clean steps since the last scale change
    pub growth_tracker: u64,
}

/// Mixed-precision loss scaler
///
/// The loss is multiplied by `scale` before backward and gradients are
/// divided by it before the optimizer sees them. A step whose gradients
/// overflow is skipped and the scale halves; after `growth_interval` clean
/// steps the scale doubles. When disabled the scale stays at 1 and every
/// step is applied.
#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u64,
    growth_tracker: u64,
}

impl LossScaler {
    /// Initial scale
    pub const INIT_SCALE: f64 = 65536.0;

    /// Create a scaler with the standard dynamics
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { Self::INIT_SCALE } else { 1.0 },
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    /// Whether dynamic scaling is active
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current scale
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Multiply the loss by the current scale
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.scale, 0.0)?)
    }

    /// Divide gradients by the scale; returns whether any is non-finite
    pub fn unscale(&self, grads: &mut Gradients) -> Result<bool> {
        let inv = 1.0 / self.scale;
        let mut found_inf = false;
        for grad in grads.values_mut() {
            if self.enabled {
                *grad = grad.affine(inv, 0.0)?;
            }
            if !found_inf {
                let sum = grad.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
                found_inf = !sum.is_finite();
            }
        }
        Ok(found_inf && self.enabled)
    }

    /// Advance the scale after a flush
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            warn!("Gradient overflow, skipping step; loss scale reduced to {}", self.scale);
            return;
        }
        self.growth_tracker += 1;
        if self.growth_tracker == self.growth_interval {
            self.scale *= self.growth_factor;
            self.growth_tracker = 0;
            debug!("Loss scale increased to {}", self.scale);
        }
    }

    /// Snapshot for checkpoints
    pub fn state_dict(&self) -> LossScalerState {
        LossScalerState {
            scale: self.scale,
            growth_tracker: self.growth_tracker,
        }
    }

    /// Restore a snapshot
    pub fn load_state_dict(&mut self, state: &LossScalerState) {
        self.scale = state.scale;
        self.growth_tracker = state.growth_tracker;
    }
}

/// Global L2 norm over all gradients
pub fn grad_norm(grads: &Gradients) -> Result<f64> {
    let mut total = 0.0;
    for grad in grads.values() {
        total += grad.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
    }
    Ok(total.sqrt())
}

/// Rescale gradients so their global norm is at most `max_norm`
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads)?;
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for grad in grads.values_mut() {
            *grad = grad.affine(coef, 0.0)?;
        }
    }
    Ok(norm)
}
