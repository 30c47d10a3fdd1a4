//! Gradient accumulation across micro-batches
//!
//! Micro-batch `i` of an epoch either accumulates (`i % A != A - 1`) or
//! flushes (`i % A == A - 1`). A flush unscales the summed gradients,
//! measures and optionally clips their norm, applies the optimizer step
//! unless the scaler found an overflow, and then clears the buffer.

use candle_core::{DType, Tensor, Var};
use tracing::trace;

use super::{clip_grad_norm, grad_norm, AdamW, Gradients, LossScaler};
use crate::distributed::ExecutionContext;
use crate::error::{Error, Result};

/// Result of one micro-batch backward pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// This micro-batch closed an accumulation window
    pub flushed: bool,
    /// The optimizer update was applied (false if skipped on overflow)
    pub applied: bool,
    /// Gradient norm measured at the flush
    pub grad_norm: Option<f64>,
}

/// Gradient buffers and window bookkeeping for one training run
#[derive(Debug)]
pub struct GradientAccumulator {
    accum_iter: usize,
    max_norm: Option<f64>,
    buffer: Gradients,
    optimizer_steps: usize,
    skipped_steps: usize,
}

impl GradientAccumulator {
    /// Accumulate over `accum_iter` micro-batches; clip when `max_norm > 0`
    pub fn new(accum_iter: usize, max_norm: Option<f64>) -> Result<Self> {
        if accum_iter == 0 {
            return Err(Error::config("accum_iter must be > 0"));
        }
        Ok(Self {
            accum_iter,
            max_norm: max_norm.filter(|&m| m > 0.0),
            buffer: Gradients::new(),
            optimizer_steps: 0,
            skipped_steps: 0,
        })
    }

    /// Micro-batches per optimizer step
    pub fn accum_iter(&self) -> usize {
        self.accum_iter
    }

    /// Whether micro-batch `step` opens a window
    pub fn is_window_start(&self, step: usize) -> bool {
        step % self.accum_iter == 0
    }

    /// Whether micro-batch `step` closes a window
    pub fn is_flush(&self, step: usize) -> bool {
        (step + 1) % self.accum_iter == 0
    }

    /// Drop any accumulated gradients
    pub fn zero_grad(&mut self) {
        self.buffer.clear();
    }

    /// Whether gradients are waiting for a flush
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Optimizer updates applied so far
    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    /// Flushes skipped because of gradient overflow
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    /// Backward `loss` for micro-batch `step` and flush at window end
    ///
    /// `loss` is the unscaled mean loss of the micro-batch; it is divided by
    /// the window size so the flushed gradient is the mean over the window.
    pub fn backward_step(
        &mut self,
        loss: &Tensor,
        step: usize,
        optimizer: &mut AdamW,
        scaler: &mut LossScaler,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome> {
        let loss = loss.affine(1.0 / self.accum_iter as f64, 0.0)?;
        let grads = scaler.scale_loss(&loss)?.backward()?;

        let params = trainable(optimizer);
        for (name, var) in &params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let summed = match self.buffer.remove(name) {
                Some(acc) => (acc + grad)?,
                None => grad.clone(),
            };
            self.buffer.insert(name.clone(), summed);
        }

        if !self.is_flush(step) {
            trace!("micro-batch {} accumulated", step);
            return Ok(StepOutcome {
                flushed: false,
                applied: false,
                grad_norm: None,
            });
        }

        if ctx.is_distributed() {
            self.all_reduce_mean(&params, ctx)?;
        }

        let found_inf = scaler.unscale(&mut self.buffer)?;
        let norm = match self.max_norm {
            Some(max_norm) => clip_grad_norm(&mut self.buffer, max_norm)?,
            None => grad_norm(&self.buffer)?,
        };

        let applied = !found_inf;
        if applied {
            optimizer.step(&self.buffer)?;
            self.optimizer_steps += 1;
        } else {
            self.skipped_steps += 1;
        }
        scaler.update(found_inf);
        self.zero_grad();

        Ok(StepOutcome {
            flushed: true,
            applied,
            grad_norm: Some(norm),
        })
    }

    /// Average the buffered gradients across workers, in parameter order
    fn all_reduce_mean(&mut self, params: &[(String, Var)], ctx: &ExecutionContext) -> Result<()> {
        let mut flat = Vec::new();
        let mut layout = Vec::with_capacity(params.len());
        for (name, var) in params {
            let grad = match self.buffer.get(name) {
                Some(g) => g.clone(),
                None => var.as_tensor().zeros_like()?,
            };
            let values = grad.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
            layout.push((name.clone(), grad, flat.len(), values.len()));
            flat.extend(values);
        }

        ctx.collective().all_reduce_sum(&mut flat)?;

        let world = ctx.world_size as f64;
        for (name, grad, offset, len) in layout {
            let mean: Vec<f64> = flat[offset..offset + len].iter().map(|v| v / world).collect();
            let reduced = Tensor::from_vec(mean, grad.dims(), grad.device())?.to_dtype(grad.dtype())?;
            self.buffer.insert(name, reduced);
        }
        Ok(())
    }
}

fn trainable(optimizer: &AdamW) -> Vec<(String, Var)> {
    optimizer
        .groups()
        .iter()
        .flat_map(|g| g.params.iter().cloned())
        .collect()
}
