//! Whole-run orchestration for fine-tuning and evaluation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Tensor};
use tracing::{debug, info, instrument, warn};

use crate::config::FinetuneConfig;
use crate::data::loader::DataLoaderConfig;
use crate::data::{DataLoader, Dataset, DistributedSampler, TensorDataset};
use crate::distributed::ExecutionContext;
use crate::error::{Error, Result};
use crate::model::Classifier;
use crate::training::checkpoints::{self, Checkpoint};
use crate::training::engine::{self, EpochOptions, EvalOutput, TrainState};
use crate::training::loss::{Criterion, Supervised};
use crate::training::metrics::format_duration;
use crate::training::mixup::Mixup;
use crate::training::optimizers::{
    add_weight_decay, param_groups_lrd, AdamW, AdamWParams, GradientAccumulator, LossScaler, LrSchedule, ParamGroup,
};
use crate::training::telemetry::{self, TelemetrySink};

/// Standard deviation of the re-initialized ViT head
pub const HEAD_INIT_STD: f64 = 2e-5;

/// Overwrite every worker's parameters with rank 0's
pub(crate) fn broadcast_parameters(model: &Classifier, ctx: &ExecutionContext) -> Result<()> {
    for (name, var) in model.named_vars() {
        let tensor = var.as_tensor();
        let local = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let shared = ctx.broadcast_from_main(&local)?;
        if shared.len() != local.len() {
            return Err(Error::collective(format!("parameter '{}' differs in size across workers", name)));
        }
        let shared = Tensor::from_vec(shared, tensor.dims(), tensor.device())?.to_dtype(tensor.dtype())?;
        var.set(&shared)?;
    }
    debug!("Parameters synchronized from rank 0");
    Ok(())
}

/// Seed the device RNG with `seed + rank`; returns the seed
pub(crate) fn seed_worker(config: &FinetuneConfig, ctx: &ExecutionContext) -> u64 {
    let seed = config.seed + ctx.rank as u64;
    if let Err(e) = ctx.device.set_seed(seed) {
        debug!("Device RNG not seeded: {}", e);
    }
    seed
}

/// Shuffled, rank-strided loader that drops the last partial batch
pub(crate) fn train_loader(dataset: Arc<dyn Dataset>, config: &FinetuneConfig, ctx: &ExecutionContext) -> DataLoader {
    let sampler = DistributedSampler::new(dataset.len(), ctx.world_size, ctx.rank, true, config.seed);
    debug!("Sampler_train = {:?}", sampler);
    let loader_config = DataLoaderConfig {
        batch_size: config.batch_size,
        drop_last: true,
    };
    DataLoader::new(dataset, sampler, loader_config, ctx.device.clone())
}

/// Log frozen tensors and return the trainable parameter count
pub(crate) fn count_trainable(model: &Classifier, frozen: &[String]) -> usize {
    if !frozen.is_empty() {
        let names: Vec<String> = model
            .named_vars()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !crate::model::is_trainable(name, frozen))
            .collect();
        info!("Freezing {} tensors: {:?}", names.len(), names);
    }
    let n_parameters = model.num_parameters(frozen);
    info!("number of params (M): {:.2}", n_parameters as f64 / 1e6);
    n_parameters
}

/// AdamW over `groups` with the run's derived learning rate and schedule
pub(crate) fn build_optimizer(
    config: &FinetuneConfig,
    ctx: &ExecutionContext,
    groups: Vec<ParamGroup>,
) -> (AdamW, EpochOptions) {
    let eff_batch_size = config.effective_batch_size(ctx.world_size);
    let lr = config.absolute_lr(ctx.world_size);
    info!("base lr: {:.2e}", lr * 256.0 / eff_batch_size as f64);
    info!("actual lr: {:.2e}", lr);
    info!("accumulate grad iterations: {}", config.accum_iter);
    info!("effective batch size: {}", eff_batch_size);

    let optimizer = AdamW::new(
        groups,
        lr,
        AdamWParams {
            betas: config.betas,
            eps: config.eps,
        },
    );
    let options = EpochOptions {
        schedule: LrSchedule {
            base_lr: lr,
            min_lr: config.min_lr,
            warmup_epochs: config.warmup_epochs,
            epochs: config.epochs as f64,
            fixed: config.fixed_lr,
        },
        print_freq: config.print_freq,
    };
    (optimizer, options)
}

/// Write a checkpoint on the main process when `output_dir` is set
pub(crate) fn save_run_checkpoint(
    config: &FinetuneConfig,
    ctx: &ExecutionContext,
    epoch: usize,
    model: &Classifier,
    optimizer: &AdamW,
    scaler: &LossScaler,
) -> Result<Option<PathBuf>> {
    let Some(dir) = config.output_dir.as_deref() else {
        return Ok(None);
    };
    if !ctx.is_main_process() {
        return Ok(None);
    }
    let config_json = serde_json::to_string(config)?;
    let checkpoint = Checkpoint::capture(epoch, model, optimizer, scaler, config_json)?;
    let path = checkpoints::save_checkpoint(dir, &checkpoint, config.checkpoint_compression)?;
    Ok(Some(path))
}

/// Outcome of [`FinetuneTrainer::run`]
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Epochs trained in this run
    pub epochs_run: Vec<usize>,
    /// Best mean AUROC seen at an evaluation epoch
    pub max_auc: f64,
    /// Optimizer updates applied in this run
    pub optimizer_steps: usize,
    /// Most recent evaluation
    pub last_eval: Option<EvalOutput>,
}

/// Fine-tuning loop over a train and a test dataset
pub struct FinetuneTrainer {
    config: FinetuneConfig,
    ctx: ExecutionContext,
    model: Classifier,
    optimizer: AdamW,
    scaler: LossScaler,
    accumulator: GradientAccumulator,
    mixup: Option<Mixup>,
    objective: Supervised,
    epoch_options: EpochOptions,
    eval_criterion: Criterion,
    train_loader: Option<DataLoader>,
    test_loader: DataLoader,
    telemetry: Option<Box<dyn TelemetrySink>>,
    n_parameters: usize,
    start_epoch: usize,
}

impl FinetuneTrainer {
    /// Load the datasets named by `config` and build the trainer
    pub fn from_config(config: FinetuneConfig, ctx: ExecutionContext) -> Result<Self> {
        config.validate()?;
        let num_classes = config.num_classes();
        let load = |path: &PathBuf| -> Result<Arc<dyn Dataset>> {
            let mut dataset = TensorDataset::from_safetensors(path, num_classes)?;
            if config.normalize {
                let (mean, std) = config.dataset.channel_stats();
                dataset = dataset.normalized(mean, std)?;
            }
            Ok(Arc::new(dataset))
        };

        let train = match (&config.train_data, config.eval) {
            (Some(path), false) => Some(load(path)?),
            _ => None,
        };
        let test_path = config
            .test_data
            .as_ref()
            .ok_or_else(|| Error::config("test_data is required"))?;
        let test = load(test_path)?;

        Self::new(config, ctx, train, test)
    }

    /// Build the trainer over in-memory datasets
    pub fn new(
        config: FinetuneConfig,
        ctx: ExecutionContext,
        train: Option<Arc<dyn Dataset>>,
        test: Arc<dyn Dataset>,
    ) -> Result<Self> {
        config.validate_training_settings()?;
        let num_classes = config.num_classes();
        let seed = seed_worker(&config, &ctx);

        if test.num_classes() != num_classes {
            return Err(Error::data(format!(
                "test set has {} classes, model expects {}",
                test.num_classes(),
                num_classes
            )));
        }

        let train_loader = match train {
            Some(dataset) if !config.eval => Some(train_loader(dataset, &config, &ctx)),
            Some(_) => None,
            None if config.eval => None,
            None => return Err(Error::config("a training set is required unless eval is set")),
        };

        let test_sampler = if config.dist_eval && ctx.is_distributed() {
            if test.len() % ctx.world_size != 0 {
                warn!(
                    "Enabling distributed evaluation with an eval dataset not divisible by process number; \
                     padded samples are dropped after gathering"
                );
            }
            DistributedSampler::new(test.len(), ctx.world_size, ctx.rank, false, config.seed)
        } else {
            DistributedSampler::sequential(test.len())
        };
        let test_loader = DataLoader::new(
            test,
            test_sampler,
            DataLoaderConfig {
                batch_size: config.batch_size,
                drop_last: false,
            },
            ctx.device.clone(),
        );

        let mixup = Mixup::from_config(&config.mixup, config.smoothing, num_classes, seed);
        if mixup.is_some() {
            info!("Mixup is activated!");
        }

        let model = Classifier::new(config.model, num_classes, config.input_size, &ctx.device)?;

        if let (Some(path), false) = (&config.finetune, config.eval) {
            checkpoints::load_finetune_weights(
                path,
                &model,
                config.checkpoint_type,
                config.load_weights_keywords.as_deref(),
            )?;
            if config.model.is_vit() {
                model.reinit_head(HEAD_INIT_STD)?;
            }
        }

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

        let criterion = Criterion::for_training(config.dataset, mixup.is_some());
        info!("criterion = {:?}", criterion);
        let objective = Supervised {
            criterion,
            last_activation: config.last_activation,
        };

        let mut trainer = Self {
            eval_criterion: Criterion::for_evaluation(config.dataset),
            start_epoch: config.start_epoch,
            config,
            ctx,
            model,
            optimizer,
            scaler,
            accumulator,
            mixup,
            objective,
            epoch_options,
            train_loader,
            test_loader,
            telemetry: None,
            n_parameters,
        };

        if let Some(path) = trainer.config.resume.clone() {
            trainer.resume(&path)?;
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

    /// Model being trained
    pub fn model(&self) -> &Classifier {
        &self.model
    }

    /// Optimizer
    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    /// Loss scaler
    pub fn scaler(&self) -> &LossScaler {
        &self.scaler
    }

    /// Gradient accumulation state
    pub fn accumulator(&self) -> &GradientAccumulator {
        &self.accumulator
    }

    /// First epoch the next [`run`](Self::run) trains
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Trainable parameter count
    pub fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    /// Restore model, optimizer and scaler from a training checkpoint
    pub fn resume(&mut self, path: &std::path::Path) -> Result<()> {
        info!("Resume checkpoint {}", path.display());
        let checkpoint = checkpoints::load_checkpoint(path)?;
        if self.config.eval {
            checkpoints::resume_from(&checkpoint, &self.model, None, None)?;
        } else {
            self.start_epoch =
                checkpoints::resume_from(&checkpoint, &self.model, Some(&mut self.optimizer), Some(&mut self.scaler))?;
            info!("With optim & sched!");
        }
        Ok(())
    }

    /// Train one epoch; returns the global-averaged train statistics
    pub fn train_epoch(&mut self, epoch: usize) -> Result<std::collections::HashMap<String, f64>> {
        let loader = self
            .train_loader
            .as_mut()
            .ok_or_else(|| Error::config("no training set loaded"))?;
        loader.set_epoch(epoch);

        let mut state = TrainState {
            model: &self.model,
            optimizer: &mut self.optimizer,
            scaler: &mut self.scaler,
            accumulator: &mut self.accumulator,
            mixup: self.mixup.as_mut(),
            objective: &self.objective,
        };
        let telemetry = self.telemetry.as_deref_mut().map(|t| t as &mut dyn TelemetrySink);
        engine::train_one_epoch(&mut state, loader, epoch, &self.epoch_options, telemetry, &self.ctx)
    }

    /// Evaluate on the test set
    pub fn evaluate(&self) -> Result<EvalOutput> {
        let output = engine::evaluate_chestxray(
            &self.model,
            &self.test_loader,
            self.eval_criterion,
            &self.ctx,
            self.config.dist_eval,
        )?;
        if self.ctx.is_main_process() {
            if let Some(log_dir) = &self.config.log_dir {
                let path = engine::save_predictions(log_dir, &output)?;
                debug!("Saved predictions to {}", path.display());
            }
        }
        Ok(output)
    }

    /// Write a checkpoint for `epoch` (main process, when `output_dir` is set)
    pub fn save(&self, epoch: usize) -> Result<Option<PathBuf>> {
        save_run_checkpoint(&self.config, &self.ctx, epoch, &self.model, &self.optimizer, &self.scaler)
    }

    /// Evaluate only, or train from `start_epoch` to `epochs`
    #[instrument(skip_all, fields(rank = self.ctx.rank))]
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.ctx.is_main_process() {
            if let Some(dir) = &self.config.output_dir {
                std::fs::create_dir_all(dir)?;
                self.config.save_yaml(dir.join("config.yaml"))?;
            }
        }

        if self.config.eval {
            let output = self.evaluate()?;
            info!(
                "Average AUC of the network on the {} test images: {:.4}",
                output.y_true.nrows(),
                output.auc_avg()
            );
            return Ok(RunSummary {
                epochs_run: Vec::new(),
                max_auc: output.auc_avg(),
                optimizer_steps: 0,
                last_eval: Some(output),
            });
        }

        info!("Start training for {} epochs", self.config.epochs);
        let started = Instant::now();
        let steps_before = self.accumulator.optimizer_steps();
        let mut summary = RunSummary {
            epochs_run: Vec::new(),
            max_auc: 0.0,
            optimizer_steps: 0,
            last_eval: None,
        };

        for epoch in self.start_epoch..self.config.epochs {
            let train_stats = self.train_epoch(epoch)?;
            summary.epochs_run.push(epoch);

            let mut test_stats = None;
            if epoch % self.config.eval_interval == 0 || epoch + 1 == self.config.epochs {
                self.save(epoch)?;

                let output = self.evaluate()?;
                info!("Average AUC on the test set images: {:.4}", output.auc_avg());
                if output.auc_avg() > summary.max_auc {
                    summary.max_auc = output.auc_avg();
                }
                info!("Max Average AUC: {:.4}", summary.max_auc);

                if let Some(sink) = self.telemetry.as_mut() {
                    sink.add_scalar("perf/auc_avg", output.auc_avg(), epoch as u64)?;
                    sink.add_scalar("perf/test_loss", output.loss(), epoch as u64)?;
                }
                test_stats = Some(output.stats.clone());
                summary.last_eval = Some(output);
            }

            if self.ctx.is_main_process() {
                if let Some(sink) = self.telemetry.as_mut() {
                    sink.flush()?;
                }
                if let Some(dir) = &self.config.output_dir {
                    let entry =
                        telemetry::epoch_log_entry(&train_stats, test_stats.as_ref(), epoch, Some(self.n_parameters));
                    telemetry::append_epoch_log(dir, &entry)?;
                }
            }
        }

        summary.optimizer_steps = self.accumulator.optimizer_steps() - steps_before;
        info!("Training time {}", format_duration(started.elapsed()));
        Ok(summary)
    }
}
