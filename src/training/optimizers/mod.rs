//! Optimization: parameter groups, AdamW, LR schedule, loss scaling and
//! gradient accumulation

pub mod accumulation;
pub mod adamw;
pub mod lr_sched;
pub mod param_groups;
pub mod scaler;

pub use accumulation::{GradientAccumulator, StepOutcome};
pub use adamw::{AdamW, AdamWParams, AdamWState};
pub use lr_sched::LrSchedule;
pub use param_groups::{add_weight_decay, param_groups_lrd, ParamGroup};
pub use scaler::{clip_grad_norm, grad_norm, LossScaler, LossScalerState};

use std::collections::HashMap;

use candle_core::Tensor;

/// Accumulated gradients keyed by parameter name
pub type Gradients = HashMap<String, Tensor>;
