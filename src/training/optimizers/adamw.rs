//! AdamW optimizer with decoupled weight decay
//!
//! Follows the PyTorch update rule: weights first shrink by
//! `lr * weight_decay`, then move by the bias-corrected Adam step.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Gradients, ParamGroup};
use crate::error::{Error, Result};

/// AdamW hyperparameters shared by every group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWParams {
    /// Coefficients of the running first and second moments
    pub betas: (f64, f64),
    /// Denominator epsilon
    pub eps: f64,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self {
            betas: (0.9, 0.999),
            eps: 1e-8,
        }
    }
}

struct Moments {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// AdamW over a list of parameter groups
pub struct AdamW {
    groups: Vec<ParamGroup>,
    params: AdamWParams,
    step: u64,
    moments: HashMap<String, Moments>,
}

impl AdamW {
    /// Create an optimizer; every group starts at `lr * lr_scale`
    pub fn new(mut groups: Vec<ParamGroup>, lr: f64, params: AdamWParams) -> Self {
        for group in &mut groups {
            group.lr = lr * group.lr_scale;
        }
        Self {
            groups,
            params,
            step: 0,
            moments: HashMap::new(),
        }
    }

    /// Parameter groups
    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Mutable parameter groups, for LR scheduling
    pub fn groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    /// Number of updates applied
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Smallest and largest group learning rates
    pub fn lr_range(&self) -> (f64, f64) {
        self.groups.iter().fold((f64::INFINITY, 0.0), |(lo, hi), g| (lo.min(g.lr), hi.max(g.lr)))
    }

    /// Apply one update from `grads`
    ///
    /// Parameters without an entry in `grads` are left untouched.
    pub fn step(&mut self, grads: &Gradients) -> Result<()> {
        self.step += 1;
        let (beta1, beta2) = self.params.betas;
        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);

        for group in &self.groups {
            let step_size = group.lr / bias_correction1;
            for (name, var) in &group.params {
                let Some(grad) = grads.get(name) else {
                    continue;
                };
                let theta = var.as_tensor();
                let grad = grad.to_dtype(theta.dtype())?;

                let moments = match self.moments.remove(name) {
                    Some(m) => m,
                    None => Moments {
                        exp_avg: theta.zeros_like()?,
                        exp_avg_sq: theta.zeros_like()?,
                    },
                };
                let exp_avg = ((moments.exp_avg * beta1)? + (&grad * (1.0 - beta1))?)?;
                let exp_avg_sq = ((moments.exp_avg_sq * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

                let denom = ((exp_avg_sq.sqrt()? / bias_correction2.sqrt())? + self.params.eps)?;
                let decayed = (theta * (1.0 - group.lr * group.weight_decay))?;
                let update = (exp_avg.div(&denom)? * step_size)?;
                var.set(&(decayed - update)?)?;

                self.moments.insert(name.clone(), Moments { exp_avg, exp_avg_sq });
            }
        }
        debug!("AdamW step {}", self.step);
        Ok(())
    }

    /// Serializable snapshot of the optimizer state
    pub fn state_dict(&self) -> Result<AdamWState> {
        let mut moments: Vec<MomentState> = self
            .moments
            .iter()
            .map(|(name, m)| -> Result<MomentState> {
                Ok(MomentState {
                    name: name.clone(),
                    shape: m.exp_avg.dims().to_vec(),
                    exp_avg: m.exp_avg.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?,
                    exp_avg_sq: m.exp_avg_sq.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?,
                })
            })
            .collect::<Result<_>>()?;
        moments.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(AdamWState {
            step: self.step,
            params: self.params,
            groups: self
                .groups
                .iter()
                .map(|g| GroupState {
                    name: g.name.clone(),
                    lr: g.lr,
                    weight_decay: g.weight_decay,
                    lr_scale: g.lr_scale,
                    param_names: g.params.iter().map(|(n, _)| n.clone()).collect(),
                })
                .collect(),
            moments,
        })
    }

    /// Restore a snapshot taken from an optimizer over the same groups
    pub fn load_state_dict(&mut self, state: &AdamWState, device: &Device) -> Result<()> {
        if state.groups.len() != self.groups.len() {
            return Err(Error::checkpoint(format!(
                "optimizer has {} param groups, checkpoint has {}",
                self.groups.len(),
                state.groups.len()
            )));
        }
        for (group, saved) in self.groups.iter_mut().zip(&state.groups) {
            let names: Vec<&String> = group.params.iter().map(|(n, _)| n).collect();
            if names.len() != saved.param_names.len() || names.iter().zip(&saved.param_names).any(|(a, b)| *a != b) {
                return Err(Error::checkpoint(format!(
                    "param group '{}' does not match checkpoint group '{}'",
                    group.name, saved.name
                )));
            }
            group.lr = saved.lr;
            group.weight_decay = saved.weight_decay;
            group.lr_scale = saved.lr_scale;
        }

        let mut moments = HashMap::with_capacity(state.moments.len());
        for m in &state.moments {
            let exp_avg = Tensor::from_slice(&m.exp_avg, m.shape.as_slice(), device)?;
            let exp_avg_sq = Tensor::from_slice(&m.exp_avg_sq, m.shape.as_slice(), device)?;
            moments.insert(m.name.clone(), Moments { exp_avg, exp_avg_sq });
        }
        self.moments = moments;
        self.step = state.step;
        self.params = state.params;
        Ok(())
    }
}

/// Saved hyperparameters of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    /// Group name
    pub name: String,
    /// Learning rate at save time
    pub lr: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// LR multiplier
    pub lr_scale: f64,
    /// Member parameter names, in order
    pub param_names: Vec<String>,
}

/// Saved moment estimates of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentState {
    /// Parameter name
    pub name: String,
    /// Tensor shape
    pub shape: Vec<usize>,
    /// First moment, row-major
    pub exp_avg: Vec<f32>,
    /// Second moment, row-major
    pub exp_avg_sq: Vec<f32>,
}

/// Serializable AdamW state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWState {
    /// Updates applied
    pub step: u64,
    /// Hyperparameters
    pub params: AdamWParams,
    /// Per-group settings
    pub groups: Vec<GroupState>,
    /// Per-parameter moments
    pub moments: Vec<MomentState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Var;

    fn single_param(value: f32, weight_decay: f64) -> (Var, AdamW) {
        let var = Var::new(&[value], &Device::Cpu).unwrap();
        let group = ParamGroup {
            name: "g".to_string(),
            params: vec![("w".to_string(), var.clone())],
            weight_decay,
            lr_scale: 1.0,
            lr: 0.0,
        };
        (var, AdamW::new(vec![group], 0.1, AdamWParams::default()))
    }

    fn grads(value: f32) -> Gradients {
        HashMap::from([("w".to_string(), Tensor::new(&[value], &Device::Cpu).unwrap())])
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        // With bias correction the first update is lr * sign(g).
        let (var, mut opt) = single_param(1.0, 0.0);
        opt.step(&grads(0.5)).unwrap();
        assert_relative_eq!(value(&var), 0.9, epsilon = 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_decoupled_weight_decay() {
        let (var, mut opt) = single_param(2.0, 0.5);
        opt.step(&grads(0.0)).unwrap();
        // 2.0 * (1 - 0.1 * 0.5), no gradient step
        assert_relative_eq!(value(&var), 1.9, epsilon = 1e-5);
    }

    #[test]
    fn test_missing_gradient_skips_param() {
        let (var, mut opt) = single_param(1.0, 0.5);
        opt.step(&HashMap::new()).unwrap();
        assert_eq!(value(&var), 1.0);
    }

    #[test]
    fn test_state_roundtrip_reproduces_next_step() {
        let (var_a, mut a) = single_param(1.0, 0.01);
        a.step(&grads(0.3)).unwrap();
        a.step(&grads(-0.2)).unwrap();
        let state = a.state_dict().unwrap();

        let (var_b, mut b) = single_param(value(&var_a), 0.01);
        b.load_state_dict(&state, &Device::Cpu).unwrap();
        assert_eq!(b.state_dict().unwrap(), state);

        a.step(&grads(0.7)).unwrap();
        b.step(&grads(0.7)).unwrap();
        assert_eq!(value(&var_a), value(&var_b));
    }

    #[test]
    fn test_load_rejects_mismatched_groups() {
        let (_, a) = single_param(1.0, 0.0);
        let mut state = a.state_dict().unwrap();
        state.groups[0].param_names = vec!["other".to_string()];
        let (_, mut b) = single_param(1.0, 0.0);
        assert!(matches!(b.load_state_dict(&state, &Device::Cpu), Err(Error::Checkpoint(_))));
    }
}
