//! Image classifiers and the model-kind factory
//!
//! ViT backbones come from `candle-transformers`; ResNets are built in
//! [`resnet`] so batch norm follows the train/eval flag. This module adapts
//! them to the [`ImageClassifier`] interface the training loop consumes and
//! owns the [`VarMap`] holding their parameters.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Linear, VarBuilder, VarMap};
use candle_transformers::models::vit;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub mod resnet;

use resnet::{ResNet, ResNetConfig};

/// Forward interface of a classification backbone
pub trait ImageClassifier: Send + Sync {
    /// Logits of shape `[batch, num_classes]`
    fn forward(&self, images: &Tensor, train: bool) -> Result<Tensor>;

    /// Parameter names excluded from weight decay regardless of rank
    fn no_weight_decay(&self) -> Vec<String> {
        Vec::new()
    }

    /// Depth used for layer-wise learning rate decay; `None` disables it
    fn num_layers(&self) -> Option<usize> {
        None
    }

    /// Layer index of a parameter for layer-wise learning rate decay
    fn layer_id(&self, _name: &str) -> usize {
        0
    }

    /// Name prefix of the classification head
    fn head_prefix(&self) -> &'static str;
}

/// Available backbones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// ViT-Ti/16
    VitTinyPatch16,
    /// ViT-S/16
    VitSmallPatch16,
    /// ViT-B/16
    VitBasePatch16,
    /// ViT-L/16
    VitLargePatch16,
    /// ResNet-18
    Resnet18,
    /// ResNet-50
    Resnet50,
    /// Flatten + linear head
    LinearProbe,
}

impl ModelKind {
    /// Whether the backbone is a vision transformer
    pub fn is_vit(&self) -> bool {
        matches!(
            self,
            Self::VitTinyPatch16 | Self::VitSmallPatch16 | Self::VitBasePatch16 | Self::VitLargePatch16
        )
    }

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VitTinyPatch16 => "vit_tiny_patch16",
            Self::VitSmallPatch16 => "vit_small_patch16",
            Self::VitBasePatch16 => "vit_base_patch16",
            Self::VitLargePatch16 => "vit_large_patch16",
            Self::Resnet18 => "resnet18",
            Self::Resnet50 => "resnet50",
            Self::LinearProbe => "linear_probe",
        }
    }

    fn vit_config(&self, input_size: usize) -> Option<vit::Config> {
        let base = vit::Config::vit_base_patch16_224();
        let (hidden_size, num_hidden_layers, num_attention_heads) = match self {
            Self::VitTinyPatch16 => (192, 12, 3),
            Self::VitSmallPatch16 => (384, 12, 6),
            Self::VitBasePatch16 => (base.hidden_size, base.num_hidden_layers, base.num_attention_heads),
            Self::VitLargePatch16 => (1024, 24, 16),
            _ => return None,
        };
        Some(vit::Config {
            hidden_size,
            num_hidden_layers,
            num_attention_heads,
            intermediate_size: hidden_size * 4,
            image_size: input_size,
            ..base
        })
    }

    /// Construct the backbone, registering its parameters through `vb`
    pub fn build(
        &self,
        num_classes: usize,
        input_size: usize,
        vb: VarBuilder<'static>,
    ) -> Result<Box<dyn ImageClassifier>> {
        if let Some(config) = self.vit_config(input_size) {
            return Ok(Box::new(VitClassifier::new(&config, num_classes, vb)?));
        }

        let net: Box<dyn ImageClassifier> = match self {
            Self::Resnet18 => Box::new(ResnetClassifier {
                net: ResNet::new(ResNetConfig::resnet18(), num_classes, vb)?,
            }),
            Self::Resnet50 => Box::new(ResnetClassifier {
                net: ResNet::new(ResNetConfig::resnet50(), num_classes, vb)?,
            }),
            Self::LinearProbe => Box::new(LinearProbe::new(input_size, num_classes, vb)?),
            _ => return Err(Error::unsupported(format!("model '{}'", self))),
        };
        Ok(net)
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s {
            "vit_tiny_patch16" => Self::VitTinyPatch16,
            "vit_small_patch16" => Self::VitSmallPatch16,
            "vit_base_patch16" => Self::VitBasePatch16,
            "vit_large_patch16" => Self::VitLargePatch16,
            "resnet18" => Self::Resnet18,
            "resnet50" => Self::Resnet50,
            "linear_probe" => Self::LinearProbe,
            other => return Err(Error::unsupported(format!("model '{}'", other))),
        };
        Ok(kind)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activation applied to logits before the training criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastActivation {
    /// Element-wise logistic
    Sigmoid,
    /// Softmax over the class dimension
    Softmax,
}

impl LastActivation {
    /// Apply to logits of shape `[batch, num_classes]`
    pub fn apply(&self, logits: &Tensor) -> Result<Tensor> {
        let out = match self {
            Self::Sigmoid => candle_nn::ops::sigmoid(logits)?,
            Self::Softmax => candle_nn::ops::softmax_last_dim(logits)?,
        };
        Ok(out)
    }
}

struct VitClassifier {
    model: vit::Model,
    depth: usize,
}

impl VitClassifier {
    fn new(config: &vit::Config, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            model: vit::Model::new(config, num_classes, vb)?,
            depth: config.num_hidden_layers,
        })
    }
}

impl ImageClassifier for VitClassifier {
    fn forward(&self, images: &Tensor, _train: bool) -> Result<Tensor> {
        Ok(self.model.forward(images)?)
    }

    fn no_weight_decay(&self) -> Vec<String> {
        vec![
            "vit.embeddings.cls_token".to_string(),
            "vit.embeddings.position_embeddings".to_string(),
        ]
    }

    fn num_layers(&self) -> Option<usize> {
        Some(self.depth + 1)
    }

    fn layer_id(&self, name: &str) -> usize {
        if name.starts_with("vit.embeddings.") {
            return 0;
        }
        if let Some(rest) = name.strip_prefix("vit.encoder.layer.") {
            if let Some(index) = rest.split('.').next().and_then(|i| i.parse::<usize>().ok()) {
                return index + 1;
            }
        }
        self.depth + 1
    }

    fn head_prefix(&self) -> &'static str {
        "classifier"
    }
}

struct ResnetClassifier {
    net: ResNet,
}

impl ImageClassifier for ResnetClassifier {
    fn forward(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        self.net.forward_t(images, train)
    }

    fn head_prefix(&self) -> &'static str {
        "fc"
    }
}

/// Flatten + linear head over the raw pixels
struct LinearProbe {
    head: Linear,
}

impl LinearProbe {
    fn new(input_size: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let in_dim = 3 * input_size * input_size;
        Ok(Self {
            head: candle_nn::linear(in_dim, num_classes, vb.pp("head"))?,
        })
    }
}

impl ImageClassifier for LinearProbe {
    fn forward(&self, images: &Tensor, _train: bool) -> Result<Tensor> {
        let flat = images.flatten_from(1)?;
        Ok(self.head.forward(&flat)?)
    }

    fn head_prefix(&self) -> &'static str {
        "head"
    }
}

/// A backbone together with the variables that parameterize it
pub struct Classifier {
    kind: ModelKind,
    num_classes: usize,
    varmap: VarMap,
    net: Box<dyn ImageClassifier>,
}

impl Classifier {
    /// Build a freshly initialized classifier on `device`
    pub fn new(kind: ModelKind, num_classes: usize, input_size: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = kind.build(num_classes, input_size, vb)?;

        let classifier = Self {
            kind,
            num_classes,
            varmap,
            net,
        };
        info!(
            "Model = {} ({} tensors, {} parameters)",
            kind,
            classifier.named_vars().len(),
            classifier.num_parameters(&[])
        );
        Ok(classifier)
    }

    /// Backbone kind
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Backbone forward interface
    pub fn net(&self) -> &dyn ImageClassifier {
        self.net.as_ref()
    }

    /// Logits for a batch of images
    pub fn forward(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        self.net.forward(images, train)
    }

    /// Parameter storage
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Every variable with its name, sorted by name
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Snapshot of the parameter values keyed by name
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        self.named_vars()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect()
    }

    /// Parameter count, excluding names that contain any of `frozen`
    pub fn num_parameters(&self, frozen: &[String]) -> usize {
        self.named_vars()
            .iter()
            .filter(|(name, _)| is_trainable(name, frozen))
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }

    /// Re-draw the classification head weight from a truncated normal
    ///
    /// Values are clamped to two standard deviations; the bias is zeroed.
    pub fn reinit_head(&self, std: f64) -> Result<()> {
        let prefix = format!("{}.", self.net.head_prefix());
        for (name, var) in self.named_vars() {
            if !name.starts_with(&prefix) {
                continue;
            }
            let t = var.as_tensor();
            let fresh = if name.ends_with("weight") {
                Tensor::randn(0f32, std as f32, t.shape(), t.device())?
                    .clamp(-2.0 * std, 2.0 * std)?
                    .to_dtype(t.dtype())?
            } else {
                t.zeros_like()?
            };
            var.set(&fresh)?;
            debug!("Re-initialized {}", name);
        }
        Ok(())
    }
}

/// Whether a parameter takes part in optimization
///
/// Batch-norm running statistics are buffers, never trained.
pub fn is_trainable(name: &str, frozen: &[String]) -> bool {
    if name.contains("running_mean") || name.contains("running_var") {
        return false;
    }
    !frozen.iter().any(|keyword| name.contains(keyword.as_str()))
}
