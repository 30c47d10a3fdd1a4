//! End-to-end fine-tuning runs on in-memory datasets

mod common;

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use approx::assert_relative_eq;
use candle_core::Device;
use cxr_vit::training::checkpoints::LATEST_CHECKPOINT;
use cxr_vit::training::engine::PREDICTIONS_FILE;
use cxr_vit::training::telemetry::{epoch_1000x, read_epoch_log, summarize_epoch_log, EPOCH_LOG};
use cxr_vit::training::MemoryTelemetry;
use cxr_vit::{ExecutionContext, FinetuneTrainer, ThreadGroup};
use tempfile::TempDir;

use common::{create_dataset, create_nan_dataset, create_test_config, label, snapshot, NUM_CLASSES};

#[test]
fn test_accumulation_steps_per_epoch() -> Result<()> {
    let dir = TempDir::new()?;
    let config = create_test_config(dir.path());
    let train = create_dataset(16, label)?;
    let test = create_dataset(20, label)?;
    let telemetry = MemoryTelemetry::new();

    let mut trainer = FinetuneTrainer::new(config, ExecutionContext::single(Device::Cpu), Some(train), test)?
        .with_telemetry(Box::new(telemetry.clone()));
    let summary = trainer.run()?;

    // 16 samples at batch 2 give 8 micro-batches; accum_iter 4 flushes twice per epoch.
    assert_eq!(summary.epochs_run, vec![0, 1]);
    assert_eq!(summary.optimizer_steps, 4);
    assert_eq!(trainer.optimizer().step_count(), 4);
    assert_eq!(trainer.accumulator().skipped_steps(), 0);

    let lr_steps: Vec<u64> = telemetry.series("lr").into_iter().map(|(step, _)| step).collect();
    assert_eq!(
        lr_steps,
        vec![
            epoch_1000x(3, 8, 0),
            epoch_1000x(7, 8, 0),
            epoch_1000x(3, 8, 1),
            epoch_1000x(7, 8, 1)
        ]
    );
    let auc_steps: Vec<u64> = telemetry.series("perf/auc_avg").into_iter().map(|(step, _)| step).collect();
    assert_eq!(auc_steps, vec![0, 1]);
    assert_eq!(telemetry.series("perf/test_loss").len(), 2);

    assert!(summary.max_auc > 0.0 && summary.max_auc <= 1.0);
    Ok(())
}

#[test]
fn test_run_writes_epoch_log_and_checkpoints() -> Result<()> {
    let dir = TempDir::new()?;
    let config = create_test_config(dir.path());
    let train = create_dataset(16, label)?;
    let test = create_dataset(20, label)?;

    let mut trainer = FinetuneTrainer::new(config, ExecutionContext::single(Device::Cpu), Some(train), test)?;
    trainer.run()?;

    for name in ["checkpoint-0.bin", "checkpoint-1.bin", LATEST_CHECKPOINT, "config.yaml", PREDICTIONS_FILE] {
        assert!(dir.path().join(name).exists(), "missing {}", name);
    }

    let entries = read_epoch_log(&dir.path().join(EPOCH_LOG))?;
    assert_eq!(entries.len(), 2);
    let expected_params = (3 * common::INPUT_SIZE * common::INPUT_SIZE + 1) * NUM_CLASSES;
    for (epoch, entry) in entries.iter().enumerate() {
        assert_eq!(entry["epoch"].as_u64(), Some(epoch as u64));
        assert_eq!(entry["n_parameters"].as_u64(), Some(expected_params as u64));
        assert!(entry["train_loss"].as_f64().is_some());
        assert!(entry["train_lr"].as_f64().is_some());
        assert!(entry["test_auc_avg"].as_f64().is_some());
        assert_eq!(entry["test_auc_each_class"].as_array().map(|a| a.len()), Some(NUM_CLASSES));
    }

    let summary = summarize_epoch_log(&entries);
    assert_eq!(summary.len(), 2);
    assert!(summary.iter().all(|row| row.train_loss.is_some() && row.test_auc_avg.is_some()));
    Ok(())
}

#[test]
fn test_eval_reports_missing_class() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = create_test_config(dir.path());
    config.eval = true;
    config.log_dir = None;

    // Class 3 has no positive sample.
    let test = create_dataset(20, |i, c| if c == 3 { 0.0 } else { label(i, c) })?;
    let mut trainer = FinetuneTrainer::new(config, ExecutionContext::single(Device::Cpu), None, test)?;
    let summary = trainer.run()?;

    assert!(summary.epochs_run.is_empty());
    let output = summary.last_eval.expect("eval output");
    assert_eq!(output.report.missing_classes_index, vec![3]);
    assert_eq!(output.report.auc_each_class[3], 0.0);

    let defined_mean = output.report.auc_each_class[..3].iter().sum::<f64>() / 3.0;
    assert_relative_eq!(output.auc_avg(), defined_mean, epsilon = 1e-12);
    assert_eq!(output.y_true.dim(), (20, NUM_CLASSES));
    assert!(output.y_pred.iter().all(|&p| (0.0..=1.0).contains(&p)));
    assert!(!dir.path().join(EPOCH_LOG).exists());
    Ok(())
}

#[test]
fn test_resume_restores_run_state() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = create_test_config(dir.path());
    config.epochs = 1;
    let train = create_dataset(16, label)?;
    let test = create_dataset(20, label)?;

    let mut first = FinetuneTrainer::new(
        config.clone(),
        ExecutionContext::single(Device::Cpu),
        Some(Arc::clone(&train)),
        Arc::clone(&test),
    )?;
    first.run()?;

    config.epochs = 2;
    config.resume = Some(dir.path().join(LATEST_CHECKPOINT));
    let mut resumed = FinetuneTrainer::new(config, ExecutionContext::single(Device::Cpu), Some(train), test)?;

    assert_eq!(resumed.start_epoch(), 1);
    assert_eq!(resumed.optimizer().step_count(), first.optimizer().step_count());
    assert_eq!(resumed.optimizer().state_dict()?, first.optimizer().state_dict()?);
    assert_eq!(resumed.scaler().state_dict(), first.scaler().state_dict());
    assert_eq!(snapshot(resumed.model())?, snapshot(first.model())?);

    let summary = resumed.run()?;
    assert_eq!(summary.epochs_run, vec![1]);
    assert_eq!(resumed.optimizer().step_count(), 4);
    Ok(())
}

#[test]
fn test_non_finite_loss_stops_run() -> Result<()> {
    let dir = TempDir::new()?;
    let config = create_test_config(dir.path());
    let train = create_nan_dataset(16)?;
    let test = create_dataset(20, label)?;

    let mut trainer = FinetuneTrainer::new(config, ExecutionContext::single(Device::Cpu), Some(train), test)?;
    let err = trainer.run().unwrap_err();
    assert!(err.is_non_finite_loss());
    assert_eq!(trainer.optimizer().step_count(), 0);
    assert!(!dir.path().join(EPOCH_LOG).exists());
    Ok(())
}

#[test]
fn test_thread_group_workers_stay_in_sync() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = create_test_config(dir.path());
    config.epochs = 1;
    config.accum_iter = 2;
    config.dist_eval = true;
    let train = create_dataset(16, label)?;
    let test = create_dataset(20, label)?;

    let handles: Vec<_> = ThreadGroup::new(2)
        .into_iter()
        .map(|member| {
            let config = config.clone();
            let train = Arc::clone(&train);
            let test = Arc::clone(&test);
            thread::spawn(move || -> cxr_vit::Result<(cxr_vit::RunSummary, u64, Vec<(String, Vec<f32>)>)> {
                let ctx = ExecutionContext::with_collective(Device::Cpu, 0, Arc::new(member));
                let mut trainer = FinetuneTrainer::new(config, ctx, Some(train), test)?;
                let summary = trainer.run()?;
                let params = snapshot(trainer.model()).map_err(cxr_vit::Error::Other)?;
                Ok((summary, trainer.optimizer().step_count(), params))
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect::<cxr_vit::Result<_>>()?;

    // 8 samples per rank at batch 2 give 4 micro-batches; accum_iter 2 flushes twice.
    for (summary, steps, _) in &results {
        assert_eq!(*steps, 2);
        assert_eq!(summary.optimizer_steps, 2);
        let eval = summary.last_eval.as_ref().expect("eval output");
        assert_eq!(eval.y_true.nrows(), 20);
    }
    assert_eq!(results[0].2, results[1].2);
    assert_eq!(results[0].0.max_auc, results[1].0.max_auc);

    let entries = read_epoch_log(&dir.path().join(EPOCH_LOG))?;
    assert_eq!(entries.len(), 1);
    Ok(())
}
