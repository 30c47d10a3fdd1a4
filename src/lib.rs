//! CXR-ViT - fine-tuning and evaluation of image classifiers on chest X-rays
//!
//! This crate provides the training loop, multi-label AUROC evaluation,
//! learning-rate scheduling and gradient accumulation used to fine-tune
//! vision transformers (and reference CNN backbones) on ChestX-ray14 and
//! CheXpert style datasets, plus a knowledge-distillation loop that trains
//! a student against a frozen teacher.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod model;
pub mod training;

// Re-exports
pub use config::{DatasetName, DeviceKind, DistillConfig, DistillLossKind, DistillSource, FinetuneConfig, MixupConfig};
pub use data::{Batch, ConcatDataset, DataLoader, Dataset, DistributedSampler, TensorDataset};
pub use distributed::{Collective, ExecutionContext, LocalCollective, ThreadGroup};
pub use error::{Error, Result};
pub use model::{Classifier, ImageClassifier, LastActivation, ModelKind};
pub use training::{DistillSummary, DistillTrainer, FinetuneTrainer, RunSummary};
