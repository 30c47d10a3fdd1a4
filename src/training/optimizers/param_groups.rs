//! Parameter grouping for weight decay and layer-wise LR decay

use std::collections::BTreeMap;

use candle_core::Var;
use tracing::debug;

use crate::model::{is_trainable, Classifier};

/// A set of parameters sharing optimizer hyperparameters
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Group name, e.g. `layer_3_decay`
    pub name: String,

    /// Parameters with their names
    pub params: Vec<(String, Var)>,

    /// Decoupled weight decay coefficient
    pub weight_decay: f64,

    /// Multiplier applied to the scheduled learning rate
    pub lr_scale: f64,

    /// Current learning rate
    pub lr: f64,
}

impl ParamGroup {
    fn empty(name: String, weight_decay: f64, lr_scale: f64) -> Self {
        Self {
            name,
            params: Vec::new(),
            weight_decay,
            lr_scale,
            lr: 0.0,
        }
    }
}

fn skips_decay(name: &str, var: &Var, no_weight_decay: &[String]) -> bool {
    var.as_tensor().rank() <= 1 || name.ends_with(".bias") || no_weight_decay.iter().any(|n| n == name)
}

/// Decay / no-decay split with unit LR scale
pub fn add_weight_decay(
    model: &Classifier,
    weight_decay: f64,
    no_weight_decay: &[String],
    frozen: &[String],
) -> Vec<ParamGroup> {
    let mut decay = ParamGroup::empty("decay".to_string(), weight_decay, 1.0);
    let mut no_decay = ParamGroup::empty("no_decay".to_string(), 0.0, 1.0);

    for (name, var) in model.named_vars() {
        if !is_trainable(&name, frozen) {
            continue;
        }
        if skips_decay(&name, &var, no_weight_decay) {
            no_decay.params.push((name, var));
        } else {
            decay.params.push((name, var));
        }
    }

    [no_decay, decay].into_iter().filter(|g| !g.params.is_empty()).collect()
}

/// Layer-wise LR decay groups for a ViT
///
/// A parameter at layer `i` is scaled by `layer_decay^(num_layers - i)`,
/// so the head trains at the full rate and the embeddings at the lowest.
/// Models without a layer structure fall back to [`add_weight_decay`].
pub fn param_groups_lrd(
    model: &Classifier,
    weight_decay: f64,
    no_weight_decay: &[String],
    layer_decay: f64,
    frozen: &[String],
) -> Vec<ParamGroup> {
    let net = model.net();
    let Some(num_layers) = net.num_layers() else {
        return add_weight_decay(model, weight_decay, no_weight_decay, frozen);
    };

    let layer_scales: Vec<f64> = (0..=num_layers)
        .map(|i| layer_decay.powi((num_layers - i) as i32))
        .collect();

    let mut groups: BTreeMap<(usize, bool), ParamGroup> = BTreeMap::new();
    for (name, var) in model.named_vars() {
        if !is_trainable(&name, frozen) {
            continue;
        }
        let no_decay = var.as_tensor().rank() == 1 || no_weight_decay.iter().any(|n| *n == name);
        let this_decay = if no_decay { 0.0 } else { weight_decay };
        let layer_id = net.layer_id(&name).min(num_layers);

        groups
            .entry((layer_id, no_decay))
            .or_insert_with(|| {
                let suffix = if no_decay { "no_decay" } else { "decay" };
                ParamGroup::empty(format!("layer_{}_{}", layer_id, suffix), this_decay, layer_scales[layer_id])
            })
            .params
            .push((name, var));
    }

    for group in groups.values() {
        debug!(
            "param group {}: {} tensors, weight_decay={}, lr_scale={:.4}",
            group.name,
            group.params.len(),
            group.weight_decay,
            group.lr_scale
        );
    }
    groups.into_values().collect()
}
