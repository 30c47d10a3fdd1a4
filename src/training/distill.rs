//! Knowledge distillation from a frozen teacher
//!
//! The student is initialized from pre-trained weights and trained to
//! reproduce the teacher's logits over one or more concatenated training
//! sets. There is no test pass: each epoch appends only train statistics
//! to `log.txt`, and checkpoints are written every `save_interval` epochs
//! and on the last one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::Tensor;
use tracing::{info, instrument, warn};

use crate::config::{DistillLossKind, FinetuneConfig};
use crate::data::{Batch, ConcatDataset, DataLoader, Dataset, TensorDataset};
use crate::distributed::ExecutionContext;
use crate::error::{Error, Result};
use crate::model::Classifier;
use crate::training::checkpoints;
use crate::training::engine::{self, EpochOptions, TrainState};
use crate::training::loss::{binary_cross_entropy_with_logits, TrainObjective};
use crate::training::metrics::format_duration;
use crate::training::optimizers::{add_weight_decay, param_groups_lrd, AdamW, GradientAccumulator, LossScaler};
use crate::training::telemetry::{self, TelemetrySink};
use crate::training::trainer::{
    broadcast_parameters, build_optimizer, count_trainable, save_run_checkpoint, seed_worker, train_loader,
};

/// Distance between student and teacher logits
pub trait DistillationLoss: Send + Sync {
    /// Scalar loss; `teacher` carries no gradient
    fn compute(&self, student: &Tensor, teacher: &Tensor) -> Result<Tensor>;
}

/// Mean squared error on raw logits
#[derive(Debug, Clone, Copy, Default)]
pub struct LogitMse;

impl DistillationLoss for LogitMse {
    fn compute(&self, student: &Tensor, teacher: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::loss::mse(student, teacher)?)
    }
}

/// BCE of student logits against `sigmoid(teacher / temperature)`
#[derive(Debug, Clone, Copy)]
pub struct SoftLabelBce {
    pub temperature: f64,
}

impl DistillationLoss for SoftLabelBce {
    fn compute(&self, student: &Tensor, teacher: &Tensor) -> Result<Tensor> {
        let soft = candle_nn::ops::sigmoid(&(teacher / self.temperature)?)?;
        binary_cross_entropy_with_logits(student, &soft)
    }
}

impl DistillLossKind {
    /// Loss implementation for this kind
    pub fn build(self, temperature: f64) -> Box<dyn DistillationLoss> {
        match self {
            Self::Mse => Box::new(LogitMse),
            Self::SoftBce => Box::new(SoftLabelBce { temperature }),
        }
    }
}

/// Student logits scored against the teacher's
pub struct DistillObjective {
    teacher: Classifier,
    loss: Box<dyn DistillationLoss>,
}

impl DistillObjective {
    pub fn new(teacher: Classifier, loss: Box<dyn DistillationLoss>) -> Self {
        Self { teacher, loss }
    }

    /// Frozen teacher
    pub fn teacher(&self) -> &Classifier {
        &self.teacher
    }
}

impl TrainObjective for DistillObjective {
    fn loss(&self, model: &Classifier, batch: &Batch) -> Result<Tensor> {
        let target = self.teacher.forward(&batch.images, false)?.detach();
        let outputs = model.forward(&batch.images, true)?;
        self.loss.compute(&outputs, &target)
    }
}

/// Outcome of [`DistillTrainer::run`]
#[derive(Debug, Clone)]
pub struct DistillSummary {
    /// Epochs trained in this run
    pub epochs_run: Vec<usize>,
    /// Optimizer updates applied in this run
    pub optimizer_steps: usize,
    /// Statistics of the final epoch
    pub last_train_stats: Option<HashMap<String, f64>>,
}

/// Student training loop against a frozen teacher
pub struct DistillTrainer {
    config: FinetuneConfig,
    ctx: ExecutionContext,
    model: Classifier,
    objective: DistillObjective,
    optimizer: AdamW,
    scaler: LossScaler,
    accumulator: GradientAccumulator,
    epoch_options: EpochOptions,
    train_loader: DataLoader,
    telemetry: Option<Box<dyn TelemetrySink>>,
    n_parameters: usize,
    start_epoch: usize,
}

impl DistillTrainer {
    /// Load and concatenate `distill.train_sets`, then build the trainer
    pub fn from_config(config: FinetuneConfig, ctx: ExecutionContext) -> Result<Self> {
        config.validate_distill()?;
        let mut members: Vec<Arc<dyn Dataset>> = Vec::with_capacity(config.distill.train_sets.len());
        for source in &config.distill.train_sets {
            let mut dataset = TensorDataset::from_safetensors(&source.path, source.num_classes())?;
            if config.normalize {
                let (mean, std) = source.dataset.channel_stats();
                dataset = dataset.normalized(mean, std)?;
            }
            info!("Train set {} ({}): {} samples", source.path.display(), source.dataset.as_str(), dataset.len());
            members.push(Arc::new(dataset));
        }
        let train = ConcatDataset::new(members)?;
        Self::new(config, ctx, Arc::new(train))
    }

    /// Build the trainer over an in-memory training set
    pub fn new(config: FinetuneConfig, ctx: ExecutionContext, train: Arc<dyn Dataset>) -> Result<Self> {
        config.validate_training_settings()?;
        let teacher_path = config
            .distill
            .teacher_model_path
            .clone()
            .ok_or_else(|| Error::config("distill.teacher_model_path is required"))?;
        let num_classes = config.num_classes();
        seed_worker(&config, &ctx);

        if config.mixup.is_active() {
            warn!("Mixup is not applied during distillation");
        }
        let train_loader = train_loader(train, &config, &ctx);

        let model = Classifier::new(config.model, num_classes, config.input_size, &ctx.device)?;
        if let Some(path) = &config.distill.student_init_weights {
            checkpoints::load_finetune_weights(
                path,
                &model,
                config.checkpoint_type,
                config.load_weights_keywords.as_deref(),
            )?;
        }

        let teacher = Classifier::new(config.distill.teacher_model, num_classes, config.input_size, &ctx.device)?;
        let report = checkpoints::load_finetune_weights(&teacher_path, &teacher, None, None)?;
        if !report.missing.is_empty() {
            return Err(Error::checkpoint(format!(
                "teacher checkpoint {} lacks {} parameters, e.g. {}",
                teacher_path.display(),
                report.missing.len(),
                report.missing[0]
            )));
        }
        info!("Teacher {} loaded from {}", config.distill.teacher_model.as_str(), teacher_path.display());

        if ctx.is_distributed() {
            broadcast_parameters(&model, &ctx)?;
        }

        let n_parameters = count_trainable(&model, &config.freeze_keywords);
        let no_weight_decay = model.net().no_weight_decay();
        let groups = if config.model.is_vit() {
            param_groups_lrd(
                &model,
                config.weight_decay,
                &no_weight_decay,
                config.layer_decay,
                &config.freeze_keywords,
            )
        } else {
            add_weight_decay(&model, config.weight_decay, &no_weight_decay, &config.freeze_keywords)
        };
        let (optimizer, epoch_options) = build_optimizer(&config, &ctx, groups);
        let scaler = LossScaler::new(config.amp);
        let accumulator = GradientAccumulator::new(config.accum_iter, config.max_norm())?;

        info!("distill loss = {:?}, temperature = {}", config.distill.loss, config.distill.temperature);
        let objective = DistillObjective::new(teacher, config.distill.loss.build(config.distill.temperature));

        let mut trainer = Self {
            start_epoch: config.start_epoch,
            config,
            ctx,
            model,
            objective,
            optimizer,
            scaler,
            accumulator,
            epoch_options,
            train_loader,
            telemetry: None,
            n_parameters,
        };

        if let Some(path) = trainer.config.resume.clone() {
            info!("Resume checkpoint {}", path.display());
            let checkpoint = checkpoints::load_checkpoint(&path)?;
            trainer.start_epoch = checkpoints::resume_from(
                &checkpoint,
                &trainer.model,
                Some(&mut trainer.optimizer),
                Some(&mut trainer.scaler),
            )?;
        }
        Ok(trainer)
    }

    /// Send scalar telemetry to `sink` (main process only)
    pub fn with_telemetry(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        if self.ctx.is_main_process() {
            self.telemetry = Some(sink);
        }
        self
    }

    /// Student being trained
    pub fn model(&self) -> &Classifier {
        &self.model
    }

    /// Frozen teacher
    pub fn teacher(&self) -> &Classifier {
        self.objective.teacher()
    }

    /// First epoch the next [`run`](Self::run) trains
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Train one epoch; returns the global-averaged train statistics
    pub fn train_epoch(&mut self, epoch: usize) -> Result<HashMap<String, f64>> {
        self.train_loader.set_epoch(epoch);
        let mut state = TrainState {
            model: &self.model,
            optimizer: &mut self.optimizer,
            scaler: &mut self.scaler,
            accumulator: &mut self.accumulator,
            mixup: None,
            objective: &self.objective,
        };
        let telemetry = self.telemetry.as_deref_mut().map(|t| t as &mut dyn TelemetrySink);
        engine::train_one_epoch(&mut state, &self.train_loader, epoch, &self.epoch_options, telemetry, &self.ctx)
    }

    /// Write a checkpoint for `epoch` (main process, when `output_dir` is set)
    pub fn save(&self, epoch: usize) -> Result<Option<PathBuf>> {
        save_run_checkpoint(&self.config, &self.ctx, epoch, &self.model, &self.optimizer, &self.scaler)
    }

    /// Train from `start_epoch` to `epochs`
    #[instrument(skip_all, fields(rank = self.ctx.rank))]
    pub fn run(&mut self) -> Result<DistillSummary> {
        if self.ctx.is_main_process() {
            if let Some(dir) = &self.config.output_dir {
                std::fs::create_dir_all(dir)?;
                self.config.save_yaml(dir.join("config.yaml"))?;
            }
        }

        info!("Start distillation for {} epochs", self.config.epochs);
        let started = Instant::now();
        let steps_before = self.accumulator.optimizer_steps();
        let mut summary = DistillSummary {
            epochs_run: Vec::new(),
            optimizer_steps: 0,
            last_train_stats: None,
        };

        for epoch in self.start_epoch..self.config.epochs {
            let train_stats = self.train_epoch(epoch)?;
            summary.epochs_run.push(epoch);

            if epoch % self.config.distill.save_interval == 0 || epoch + 1 == self.config.epochs {
                self.save(epoch)?;
            }

            if self.ctx.is_main_process() {
                if let Some(sink) = self.telemetry.as_mut() {
                    sink.flush()?;
                }
                if let Some(dir) = &self.config.output_dir {
                    let entry = telemetry::epoch_log_entry(&train_stats, None, epoch, Some(self.n_parameters));
                    telemetry::append_epoch_log(dir, &entry)?;
                }
            }
            summary.last_train_stats = Some(train_stats);
        }

        summary.optimizer_steps = self.accumulator.optimizer_steps() - steps_before;
        info!("Training time {}", format_duration(started.elapsed()));
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn logits(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, (2, 2), &Device::Cpu).unwrap()
    }

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_mse_is_zero_for_identical_logits() {
        let student = logits(&[0.5, -1.0, 2.0, 0.0]);
        let loss = DistillLossKind::Mse.build(1.0);
        assert_relative_eq!(scalar(loss.compute(&student, &student).unwrap()), 0.0);

        let shifted = (&student + 1.0).unwrap();
        assert_relative_eq!(scalar(loss.compute(&student, &shifted).unwrap()), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_soft_bce_uses_tempered_teacher() {
        let student = logits(&[0.5, -1.0, 2.0, 0.0]);
        let teacher = logits(&[4.0, -2.0, 0.0, 6.0]);
        let temperature = 2.0;

        let expected = {
            let soft = candle_nn::ops::sigmoid(&(&teacher / temperature).unwrap()).unwrap();
            scalar(binary_cross_entropy_with_logits(&student, &soft).unwrap())
        };
        let loss = DistillLossKind::SoftBce.build(temperature);
        assert_relative_eq!(scalar(loss.compute(&student, &teacher).unwrap()), expected, epsilon = 1e-6);

        let untempered = scalar(DistillLossKind::SoftBce.build(1.0).compute(&student, &teacher).unwrap());
        assert!((untempered - expected).abs() > 1e-4);
    }
}
