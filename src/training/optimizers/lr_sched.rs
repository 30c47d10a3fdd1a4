//! Half-cycle cosine schedule with linear warmup
//!
//! Progress is measured in fractional epochs, so the schedule does not
//! depend on batch size or on how many micro-batches make up a step.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use super::AdamW;

/// Per-iteration learning rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    /// Peak learning rate reached at the end of warmup
    pub base_lr: f64,
    /// Floor approached by the cosine decay
    pub min_lr: f64,
    /// Length of the linear warmup in epochs
    pub warmup_epochs: f64,
    /// Total epochs
    pub epochs: f64,
    /// Hold `base_lr` for the whole run
    pub fixed: bool,
}

impl LrSchedule {
    /// Learning rate at fractional epoch `t`
    pub fn lr_at(&self, t: f64) -> f64 {
        if self.fixed {
            return self.base_lr;
        }
        if t < self.warmup_epochs {
            return self.base_lr * t / self.warmup_epochs;
        }
        let span = self.epochs - self.warmup_epochs;
        if span <= 0.0 {
            return self.base_lr;
        }
        let progress = ((t - self.warmup_epochs) / span).min(1.0);
        self.min_lr + (self.base_lr - self.min_lr) * 0.5 * (1.0 + (PI * progress).cos())
    }

    /// Set every group to `lr_at(t) * lr_scale`; returns the unscaled rate
    pub fn adjust_learning_rate(&self, optimizer: &mut AdamW, t: f64) -> f64 {
        let lr = self.lr_at(t);
        for group in optimizer.groups_mut() {
            group.lr = lr * group.lr_scale;
        }
        lr
    }
}
