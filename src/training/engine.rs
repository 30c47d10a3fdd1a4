//! Per-epoch training and evaluation passes

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use ndarray::Array2;
use serde_json::{Map, Value};
use tracing::{error, info, instrument};

use crate::data::DataLoader;
use crate::distributed::ExecutionContext;
use crate::error::{Error, Result};
use crate::model::Classifier;
use crate::training::auroc::{compute_auroc, multilabel_accuracy, one_hot, AurocReport};
use crate::training::loss::{Criterion, TrainObjective};
use crate::training::metrics::{MetricLogger, SmoothedValue};
use crate::training::mixup::Mixup;
use crate::training::optimizers::{AdamW, GradientAccumulator, LossScaler, LrSchedule};
use crate::training::telemetry::{epoch_1000x, TelemetrySink};

/// File holding `y_gt` / `y_pred` of the last evaluation
pub const PREDICTIONS_FILE: &str = "eval_predictions.safetensors";

/// Mutable training state threaded through each epoch
pub struct TrainState<'a> {
    /// Model being trained
    pub model: &'a Classifier,
    /// Optimizer over the trainable parameter groups
    pub optimizer: &'a mut AdamW,
    /// Loss scaler
    pub scaler: &'a mut LossScaler,
    /// Gradient buffers and window bookkeeping
    pub accumulator: &'a mut GradientAccumulator,
    /// Label-mixing augmentation
    pub mixup: Option<&'a mut Mixup>,
    /// Turns a batch into the loss to minimize
    pub objective: &'a dyn TrainObjective,
}

/// Fixed per-run settings of the training pass
#[derive(Debug, Clone, Copy)]
pub struct EpochOptions {
    /// Learning rate schedule
    pub schedule: LrSchedule,
    /// Steps between progress lines
    pub print_freq: usize,
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Run one epoch over `loader`; returns each meter's global average
///
/// The learning rate is set at the first micro-batch of every window.
/// A non-finite loss on any worker stops every worker with
/// [`Error::NonFiniteLoss`].
#[instrument(skip_all, fields(epoch = epoch))]
pub fn train_one_epoch(
    state: &mut TrainState<'_>,
    loader: &DataLoader,
    epoch: usize,
    options: &EpochOptions,
    mut telemetry: Option<&mut dyn TelemetrySink>,
    ctx: &ExecutionContext,
) -> Result<HashMap<String, f64>> {
    let mut logger = MetricLogger::new("  ");
    logger.add_meter("lr", SmoothedValue::value_only(1, 6));
    let header = format!("Epoch: [{}]", epoch);
    let len = loader.len();

    state.accumulator.zero_grad();

    for (step, batch) in loader.iter().enumerate() {
        let batch = batch?;

        if state.accumulator.is_window_start(step) {
            let t = step as f64 / len as f64 + epoch as f64;
            options.schedule.adjust_learning_rate(state.optimizer, t);
        }

        let batch = match state.mixup.as_mut() {
            Some(mixup) => mixup.apply(&batch)?,
            None => batch,
        };

        let loss = state.objective.loss(state.model, &batch)?;
        let loss_value = scalar(&loss)?;

        // Reduced before the check so every worker sees a divergence together.
        let loss_value_reduce = ctx.all_reduce_mean(loss_value)?;
        if !loss_value.is_finite() || !loss_value_reduce.is_finite() {
            let value = if loss_value.is_finite() { loss_value_reduce } else { loss_value };
            error!("Loss is {}, stopping training", value);
            return Err(Error::NonFiniteLoss { value });
        }

        let outcome = state
            .accumulator
            .backward_step(&loss, step, state.optimizer, state.scaler, ctx)?;
        ctx.synchronize()?;

        logger.update("loss", loss_value, 1);
        let (_, max_lr) = state.optimizer.lr_range();
        logger.update("lr", max_lr, 1);

        if outcome.flushed {
            if let Some(sink) = telemetry.as_mut() {
                let x = epoch_1000x(step, len, epoch);
                sink.add_scalar("loss", loss_value_reduce, x)?;
                sink.add_scalar("lr", max_lr, x)?;
            }
        }

        logger.log_progress(&header, step, len, options.print_freq);
    }

    logger.log_total_time(&header, len);
    logger.synchronize_between_processes(ctx)?;
    info!("Averaged stats: {}", logger);
    Ok(logger.global_averages())
}

/// Result of a full evaluation pass
#[derive(Debug, Clone)]
pub struct EvalOutput {
    /// Scalar and per-class statistics, as logged
    pub stats: Map<String, Value>,
    /// AUROC summary
    pub report: AurocReport,
    /// Ground truth, `[samples, classes]`
    pub y_true: Array2<f32>,
    /// Sigmoid probabilities, `[samples, classes]`
    pub y_pred: Array2<f32>,
}

impl EvalOutput {
    /// Mean AUROC over the defined classes
    pub fn auc_avg(&self) -> f64 {
        self.report.auc_avg
    }

    /// Mean evaluation loss
    pub fn loss(&self) -> f64 {
        self.stats.get("loss").and_then(Value::as_f64).unwrap_or(f64::NAN)
    }
}

/// Evaluate on the whole of `loader` and score multi-label AUROC
///
/// With `gather`, each worker holds a strided shard of an unshuffled
/// sampler; shards are all-gathered and re-interleaved so the metric
/// covers the full set exactly once.
#[instrument(skip_all)]
pub fn evaluate_chestxray(
    model: &Classifier,
    loader: &DataLoader,
    criterion: Criterion,
    ctx: &ExecutionContext,
    gather: bool,
) -> Result<EvalOutput> {
    let num_classes = model.num_classes();
    let mut logger = MetricLogger::new("  ");
    let header = "Test:";
    let len = loader.len();

    let mut logits: Vec<f32> = Vec::new();
    let mut targets: Vec<f32> = Vec::new();

    for (step, batch) in loader.iter().enumerate() {
        let batch = batch?;
        let output = eval_forward(model, &batch.images)?;
        let loss = criterion.compute(&output, &batch.targets)?;
        logger.update("loss", scalar(&loss)?, 1);

        logits.extend(output.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?);
        targets.extend(dense_rows(&batch.targets, num_classes)?);

        logger.log_progress(header, step, len, 10);
    }

    let (logits, targets) = if gather && ctx.is_distributed() {
        let total = loader.dataset().len();
        (
            gather_interleaved(&logits, num_classes, total, ctx)?,
            gather_interleaved(&targets, num_classes, total, ctx)?,
        )
    } else {
        (logits, targets)
    };

    let rows = logits.len() / num_classes.max(1);
    let logits = Array2::from_shape_vec((rows, num_classes), logits)
        .map_err(|e| Error::data(format!("prediction matrix: {}", e)))?;
    let y_true = Array2::from_shape_vec((rows, num_classes), targets)
        .map_err(|e| Error::data(format!("ground-truth matrix: {}", e)))?;
    let y_pred = logits.mapv(|z| 1.0 / (1.0 + (-z).exp()));
    info!("ground truth {:?}, predictions {:?}", y_true.dim(), y_pred.dim());

    let report = compute_auroc(y_true.view(), y_pred.view())?;
    info!("AUROC per class: {:?}", report.auc_each_class);
    let acc = multilabel_accuracy(y_true.view(), logits.view());

    logger.synchronize_between_processes(ctx)?;
    let loss = logger.meter("loss").map(SmoothedValue::global_avg).unwrap_or(f64::NAN);
    info!("* Acc {:.3} AUC {:.4} Loss {:.3}", acc, report.auc_avg, loss);

    let mut stats = Map::new();
    stats.insert("loss".to_string(), serde_json::json!(loss));
    stats.insert("acc".to_string(), serde_json::json!(acc));
    stats.insert("auc_avg".to_string(), serde_json::json!(report.auc_avg));
    stats.insert("auc_each_class".to_string(), serde_json::json!(report.auc_each_class));
    stats.insert(
        "missing_classes_index".to_string(),
        serde_json::json!(report.missing_classes_index),
    );

    Ok(EvalOutput {
        stats,
        report,
        y_true,
        y_pred,
    })
}

/// Eval-mode logits cut off from the autograd graph
fn eval_forward(model: &Classifier, images: &Tensor) -> Result<Tensor> {
    Ok(model.forward(images, false)?.detach())
}

/// Targets as row-major `[batch, num_classes]` values
fn dense_rows(targets: &Tensor, num_classes: usize) -> Result<Vec<f32>> {
    if targets.rank() == 1 {
        let indices = targets.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        return Ok(one_hot(&indices, num_classes)?.iter().copied().collect());
    }
    Ok(targets.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

/// All-gather per-rank rows and restore dataset order
fn gather_interleaved(local: &[f32], width: usize, total: usize, ctx: &ExecutionContext) -> Result<Vec<f32>> {
    let shards = ctx.collective().all_gather(local)?;
    let per_rank = shards.first().map(|s| s.len() / width.max(1)).unwrap_or(0);

    let mut out = Vec::with_capacity(total * width);
    'rows: for j in 0..per_rank {
        for shard in &shards {
            if out.len() == total * width {
                break 'rows;
            }
            let row = shard.get(j * width..(j + 1) * width).ok_or_else(|| {
                Error::collective("evaluation shards differ in length".to_string())
            })?;
            out.extend_from_slice(row);
        }
    }
    Ok(out)
}

/// Write `y_gt` / `y_pred` to `<log_dir>/eval_predictions.safetensors`
pub fn save_predictions(log_dir: &Path, output: &EvalOutput) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let to_tensor = |a: &Array2<f32>| -> Result<Tensor> {
        Ok(Tensor::from_vec(a.iter().copied().collect::<Vec<f32>>(), a.dim(), &Device::Cpu)?)
    };
    let tensors = HashMap::from([
        ("y_gt".to_string(), to_tensor(&output.y_true)?),
        ("y_pred".to_string(), to_tensor(&output.y_pred)?),
    ]);
    let path = log_dir.join(PREDICTIONS_FILE);
    candle_core::safetensors::save(&tensors, &path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ThreadGroup;
    use std::sync::Arc;

    #[test]
    fn test_gather_interleaved_restores_order() {
        // 5 rows over 2 ranks: rank 0 holds rows 0, 2, 4; rank 1 holds 1, 3 and a pad of row 0
        let handles: Vec<_> = ThreadGroup::new(2)
            .into_iter()
            .map(|member| {
                std::thread::spawn(move || {
                    let ctx = ExecutionContext::with_collective(Device::Cpu, 0, Arc::new(member));
                    let local: Vec<f32> = if ctx.rank == 0 {
                        vec![0.0, 0.0, 2.0, 2.0, 4.0, 4.0]
                    } else {
                        vec![1.0, 1.0, 3.0, 3.0, 0.0, 0.0]
                    };
                    gather_interleaved(&local, 2, 5, &ctx).unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.join().unwrap(),
                vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0]
            );
        }
    }

    #[test]
    fn test_eval_forward_is_detached() {
        let model = Classifier::new(crate::model::ModelKind::LinearProbe, 2, 2, &Device::Cpu).unwrap();
        let images = Tensor::ones((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(model.forward(&images, false).unwrap().track_op());
        assert!(!eval_forward(&model, &images).unwrap().track_op());
    }

    #[test]
    fn test_dense_rows_from_indices() {
        let t = Tensor::new(&[1u32, 0], &Device::Cpu).unwrap();
        assert_eq!(dense_rows(&t, 2).unwrap(), vec![0.0, 1.0, 1.0, 0.0]);
    }
}
