//! Training configuration for chest X-ray fine-tuning
//!
//! Options are layered: built-in defaults, then an optional config file
//! (JSON, YAML or TOML), then `CXR_`-prefixed environment variables, then
//! explicit command-line overrides applied by the binary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{LastActivation, ModelKind};

/// Main fine-tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    /// Batch size per worker (effective batch is `batch_size * accum_iter * world_size`)
    pub batch_size: usize,

    /// Number of training epochs
    pub epochs: usize,

    /// Micro-batches accumulated per optimizer step
    pub accum_iter: usize,

    /// Backbone to train
    pub model: ModelKind,

    /// Square input resolution
    pub input_size: usize,

    /// Gradient-norm clipping threshold; `None` or `<= 0` disables clipping
    pub clip_grad: Option<f64>,

    /// Weight decay for decayed parameter groups
    pub weight_decay: f64,

    /// Absolute learning rate; derived from `blr` when absent
    pub lr: Option<f64>,

    /// Base learning rate: `lr = blr * effective_batch / 256`
    pub blr: f64,

    /// Lower bound reached by the cosine decay
    pub min_lr: f64,

    /// Layer-wise learning rate decay for ViT backbones
    pub layer_decay: f64,

    /// Epochs of linear warmup
    pub warmup_epochs: f64,

    /// Keep the learning rate constant at `lr`
    pub fixed_lr: bool,

    /// Adam betas
    pub betas: (f64, f64),

    /// Adam epsilon
    pub eps: f64,

    /// Label smoothing applied by mixup targets
    pub smoothing: f64,

    /// Mixup / cutmix augmentation
    pub mixup: MixupConfig,

    /// Dataset, selecting the criterion and default class count
    pub dataset: DatasetName,

    /// Number of output classes; defaults to the dataset's class count
    pub nb_classes: Option<usize>,

    /// Activation applied to the logits before the training criterion
    pub last_activation: Option<LastActivation>,

    /// Dynamic loss scaling
    pub amp: bool,

    /// Weights to initialize from before fine-tuning
    pub finetune: Option<PathBuf>,

    /// Layout of the fine-tuning checkpoint keys
    pub checkpoint_type: Option<CheckpointType>,

    /// Only load fine-tuning weights whose names contain one of these
    pub load_weights_keywords: Option<Vec<String>>,

    /// Exclude parameters whose names contain one of these from training
    pub freeze_keywords: Vec<String>,

    /// Checkpoint to resume from (model, optimizer and scaler state)
    pub resume: Option<PathBuf>,

    /// First epoch to run; overwritten on resume
    pub start_epoch: usize,

    /// Evaluate only, then exit
    pub eval: bool,

    /// Shard the evaluation set across workers
    pub dist_eval: bool,

    /// Epochs between checkpoint + evaluation
    pub eval_interval: usize,

    /// Directory for checkpoints and the epoch log; `None` disables saving
    pub output_dir: Option<PathBuf>,

    /// Directory for telemetry and evaluation arrays
    pub log_dir: Option<PathBuf>,

    /// Gzip checkpoint files
    pub checkpoint_compression: bool,

    /// Training set tensor file
    pub train_data: Option<PathBuf>,

    /// Test set tensor file
    pub test_data: Option<PathBuf>,

    /// Normalize images with the dataset's channel statistics
    pub normalize: bool,

    /// Compute device
    pub device: DeviceKind,

    /// Random seed (offset by rank)
    pub seed: u64,

    /// Steps between progress lines while training
    pub print_freq: usize,

    /// Knowledge-distillation run settings
    pub distill: DistillConfig,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            epochs: 50,
            accum_iter: 1,
            model: ModelKind::VitBasePatch16,
            input_size: 224,
            clip_grad: None,
            weight_decay: 0.05,
            lr: None,
            blr: 1e-3,
            min_lr: 1e-6,
            layer_decay: 0.75,
            warmup_epochs: 5.0,
            fixed_lr: false,
            betas: (0.9, 0.999),
            eps: 1e-8,
            smoothing: 0.1,
            mixup: MixupConfig::default(),
            dataset: DatasetName::ChestXray14,
            nb_classes: None,
            last_activation: None,
            amp: true,
            finetune: None,
            checkpoint_type: None,
            load_weights_keywords: None,
            freeze_keywords: Vec::new(),
            resume: None,
            start_epoch: 0,
            eval: false,
            dist_eval: false,
            eval_interval: 10,
            output_dir: Some(PathBuf::from("./output_dir")),
            log_dir: Some(PathBuf::from("./output_dir")),
            checkpoint_compression: false,
            train_data: None,
            test_data: None,
            normalize: false,
            device: DeviceKind::Cpu,
            seed: 0,
            print_freq: 20,
            distill: DistillConfig::default(),
        }
    }
}

impl FinetuneConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::config(format!("Config file not found: {}", path.display())));
            }
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CXR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate configuration before any training work begins
    pub fn validate(&self) -> Result<()> {
        self.validate_training_settings()?;

        if self.test_data.is_none() {
            return Err(Error::config("test_data is required"));
        }
        if !self.eval && self.train_data.is_none() {
            return Err(Error::config("train_data is required unless eval is set"));
        }

        Ok(())
    }

    /// Validate everything except the dataset paths
    pub fn validate_training_settings(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        if self.accum_iter == 0 {
            return Err(Error::config("accum_iter must be > 0"));
        }
        if self.epochs == 0 {
            return Err(Error::config("epochs must be > 0"));
        }
        if self.eval_interval == 0 {
            return Err(Error::config("eval_interval must be > 0"));
        }
        if self.input_size == 0 {
            return Err(Error::config("input_size must be > 0"));
        }
        if self.warmup_epochs < 0.0 {
            return Err(Error::config("warmup_epochs must be >= 0"));
        }
        if self.warmup_epochs > self.epochs as f64 {
            warn!(
                "warmup_epochs ({}) exceeds epochs ({}); the schedule never leaves warmup",
                self.warmup_epochs, self.epochs
            );
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(Error::config("smoothing must be in [0, 1)"));
        }
        if self.layer_decay <= 0.0 || self.layer_decay > 1.0 {
            return Err(Error::config("layer_decay must be in (0, 1]"));
        }
        if let Some(lr) = self.lr {
            if lr <= 0.0 {
                return Err(Error::config("lr must be > 0"));
            }
        }
        if self.nb_classes == Some(0) {
            return Err(Error::config("nb_classes must be > 0"));
        }

        self.mixup.validate()?;
        if self.mixup.is_active() && self.batch_size % 2 != 0 {
            return Err(Error::config("batch_size must be even when mixup/cutmix is active"));
        }

        Ok(())
    }

    /// Validate a distillation run: training settings plus the teacher and sources
    pub fn validate_distill(&self) -> Result<()> {
        self.validate_training_settings()?;
        self.distill.validate()?;
        if self.distill.teacher_model_path.is_none() {
            return Err(Error::config("distill.teacher_model_path is required"));
        }
        if self.distill.train_sets.is_empty() {
            return Err(Error::config("distill.train_sets must name at least one training set"));
        }
        Ok(())
    }

    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        self.nb_classes.unwrap_or_else(|| self.dataset.default_num_classes())
    }

    /// Samples per optimizer step across all workers
    pub fn effective_batch_size(&self, world_size: usize) -> usize {
        self.batch_size * self.accum_iter * world_size
    }

    /// Absolute learning rate
    pub fn absolute_lr(&self, world_size: usize) -> f64 {
        self.lr
            .unwrap_or_else(|| self.blr * self.effective_batch_size(world_size) as f64 / 256.0)
    }

    /// Gradient clipping threshold, if clipping is enabled
    pub fn max_norm(&self) -> Option<f64> {
        self.clip_grad.filter(|&norm| norm > 0.0)
    }

    /// Write the resolved configuration as YAML
    pub fn save_yaml(&self, path: impl AsRef<Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| Error::config(format!("Failed to serialize configuration: {}", e)))?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}

/// Supported datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatasetName {
    /// NIH ChestX-ray14, 14-way multi-label
    ChestXray14,
    /// CheXpert, 5 competition findings
    Chexpert,
}

impl DatasetName {
    /// Class count used when `nb_classes` is not given
    pub fn default_num_classes(&self) -> usize {
        match self {
            Self::ChestXray14 => 14,
            Self::Chexpert => 5,
        }
    }

    /// Per-channel (mean, std) used for input normalization
    pub fn channel_stats(&self) -> ([f32; 3], [f32; 3]) {
        match self {
            Self::ChestXray14 => ([0.5056; 3], [0.252; 3]),
            Self::Chexpert => ([0.485, 0.456, 0.406], [0.229, 0.224, 0.225]),
        }
    }

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChestXray14 => "chestxray",
            Self::Chexpert => "chexpert",
        }
    }
}

impl FromStr for DatasetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chestxray" | "chestxray_nih" | "chestxray14" => Ok(Self::ChestXray14),
            "chexpert" => Ok(Self::Chexpert),
            other => Err(Error::unsupported(format!("dataset '{}'", other))),
        }
    }
}

impl TryFrom<String> for DatasetName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DatasetName> for String {
    fn from(value: DatasetName) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key layout of a fine-tuning checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Segmentation-model encoder weights stored under `model.encoder.`
    SmpEncoder,
}

/// How mixup parameters are drawn across a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixupMode {
    /// One lambda and one box per batch
    Batch,
    /// Per sample pair
    Pair,
    /// Per element
    Elem,
}

/// Mixup / cutmix configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixupConfig {
    /// Mixup alpha; enabled if > 0
    pub mixup: f64,
    /// Cutmix alpha; enabled if > 0
    pub cutmix: f64,
    /// Cutmix min/max box ratio; overrides alpha and enables cutmix
    pub cutmix_minmax: Option<(f64, f64)>,
    /// Probability of mixing a batch at all
    pub prob: f64,
    /// Probability of cutmix when both are enabled
    pub switch_prob: f64,
    /// Parameter sharing mode
    pub mode: MixupMode,
}

impl Default for MixupConfig {
    fn default() -> Self {
        Self {
            mixup: 0.0,
            cutmix: 0.0,
            cutmix_minmax: None,
            prob: 1.0,
            switch_prob: 0.5,
            mode: MixupMode::Batch,
        }
    }
}

impl MixupConfig {
    /// Whether any label-mixing augmentation is enabled
    pub fn is_active(&self) -> bool {
        self.mixup > 0.0 || self.cutmix > 0.0 || self.cutmix_minmax.is_some()
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.prob) {
            return Err(Error::config("mixup.prob must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.switch_prob) {
            return Err(Error::config("mixup.switch_prob must be in [0, 1]"));
        }
        if self.mixup < 0.0 || self.cutmix < 0.0 {
            return Err(Error::config("mixup/cutmix alpha must be >= 0"));
        }
        if let Some((lo, hi)) = self.cutmix_minmax {
            if !(0.0 < lo && lo <= hi && hi <= 1.0) {
                return Err(Error::config("cutmix_minmax must satisfy 0 < min <= max <= 1"));
            }
        }
        if self.is_active() && self.mode != MixupMode::Batch {
            return Err(Error::unsupported(format!("mixup mode '{:?}'", self.mode)));
        }
        Ok(())
    }
}

/// Student/teacher loss used by distillation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillLossKind {
    /// Mean squared error between student and teacher logits
    Mse,
    /// BCE on student logits against the teacher's tempered sigmoid
    SoftBce,
}

/// One training source of a distillation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillSource {
    /// Tensor file with `images` and `targets`
    pub path: PathBuf,
    /// Dataset the file was drawn from; selects its normalization
    pub dataset: DatasetName,
    /// Target width of the file; defaults to the dataset's class count
    #[serde(default)]
    pub nb_classes: Option<usize>,
}

impl DistillSource {
    /// Target width of the file
    pub fn num_classes(&self) -> usize {
        self.nb_classes.unwrap_or_else(|| self.dataset.default_num_classes())
    }
}

/// Knowledge-distillation settings
///
/// The student is the run's `model`; it starts from `student_init_weights`
/// (filtered by `load_weights_keywords`) and learns to match a frozen
/// teacher loaded from `teacher_model_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    /// Teacher backbone
    pub teacher_model: ModelKind,
    /// Teacher weights (safetensors or a crate checkpoint)
    pub teacher_model_path: Option<PathBuf>,
    /// Initial student weights
    pub student_init_weights: Option<PathBuf>,
    /// Training sets, concatenated in order
    pub train_sets: Vec<DistillSource>,
    /// Student/teacher loss
    pub loss: DistillLossKind,
    /// Softening temperature applied to teacher logits
    pub temperature: f64,
    /// Epochs between checkpoints; the last epoch is always saved
    pub save_interval: usize,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            teacher_model: ModelKind::VitBasePatch16,
            teacher_model_path: None,
            student_init_weights: None,
            train_sets: Vec::new(),
            loss: DistillLossKind::Mse,
            temperature: 1.0,
            save_interval: 5,
        }
    }
}

impl DistillConfig {
    fn validate(&self) -> Result<()> {
        if self.save_interval == 0 {
            return Err(Error::config("distill.save_interval must be > 0"));
        }
        if self.temperature <= 0.0 {
            return Err(Error::config("distill.temperature must be > 0"));
        }
        if self.train_sets.iter().any(|s| s.nb_classes == Some(0)) {
            return Err(Error::config("distill.train_sets nb_classes must be > 0"));
        }
        Ok(())
    }
}

/// Compute device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Host CPU
    Cpu,
    /// NVIDIA GPU (requires the `cuda` feature)
    Cuda,
    /// Apple GPU (requires the `metal` feature)
    Metal,
}

impl DeviceKind {
    /// Open the device with the given ordinal
    pub fn open(&self, ordinal: usize) -> Result<Device> {
        let device = match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda => Device::new_cuda(ordinal)?,
            Self::Metal => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}
