//! Fine-tuning and evaluation infrastructure
//!
//! # Main Components
//!
//! - **Engine**: one training epoch and one evaluation pass
//! - **Optimizers**: AdamW with layer-wise decay groups, cosine schedule,
//!   loss scaling and gradient accumulation
//! - **AUROC**: per-class ROC AUC with missing-class handling
//! - **Checkpoints**: resumable run state and pre-trained weight loading
//! - **Distill**: student training against a frozen teacher
//! - **Telemetry**: scalar events and the per-epoch JSON log
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cxr_vit::{ExecutionContext, FinetuneConfig, FinetuneTrainer};
//! use candle_core::Device;
//!
//! let config = FinetuneConfig::load(Some("finetune.yaml".as_ref()))?;
//! let ctx = ExecutionContext::single(Device::Cpu);
//! let summary = FinetuneTrainer::from_config(config, ctx)?.run()?;
//! println!("max AUC {:.4}", summary.max_auc);
//! ```

pub mod auroc;
pub mod checkpoints;
pub mod distill;
pub mod engine;
pub mod loss;
pub mod metrics;
pub mod mixup;
pub mod optimizers;
pub mod telemetry;
pub mod trainer;

pub use auroc::{compute_auroc, roc_auc_score, AurocReport};
pub use checkpoints::{load_checkpoint, save_checkpoint, Checkpoint};
pub use distill::{DistillObjective, DistillSummary, DistillTrainer, DistillationLoss};
pub use engine::{evaluate_chestxray, train_one_epoch, EpochOptions, EvalOutput, TrainState};
pub use loss::{Criterion, Supervised, TrainObjective};
pub use metrics::{MetricLogger, SmoothedValue};
pub use mixup::Mixup;
pub use optimizers::{AdamW, GradientAccumulator, LossScaler, LrSchedule};
pub use telemetry::{JsonlTelemetry, MemoryTelemetry, TelemetrySink};
pub use trainer::{FinetuneTrainer, RunSummary};
