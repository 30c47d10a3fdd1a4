//! End-to-end distillation runs against a saved teacher

mod common;

use std::path::Path;

use anyhow::Result;
use candle_core::Device;
use cxr_vit::training::telemetry::{read_epoch_log, EPOCH_LOG};
use cxr_vit::{
    Classifier, DatasetName, DistillConfig, DistillSource, DistillTrainer, ExecutionContext, FinetuneConfig, ModelKind,
};
use tempfile::TempDir;

use common::{create_test_config, snapshot, write_dataset, INPUT_SIZE, NUM_CLASSES};

fn save_teacher(path: &Path) -> Result<Classifier> {
    let teacher = Classifier::new(ModelKind::LinearProbe, NUM_CLASSES, INPUT_SIZE, &Device::Cpu)?;
    candle_core::safetensors::save(&teacher.state_dict(), path)?;
    Ok(teacher)
}

/// 16 four-label samples followed by 8 two-label samples
fn distill_config(dir: &Path) -> Result<FinetuneConfig> {
    let chexpert = dir.join("chexpert.safetensors");
    let nih = dir.join("nih.safetensors");
    write_dataset(&chexpert, 16, NUM_CLASSES, None)?;
    write_dataset(&nih, 8, 2, None)?;

    let mut config = create_test_config(dir);
    config.epochs = 3;
    config.test_data = None;
    config.distill = DistillConfig {
        teacher_model: ModelKind::LinearProbe,
        teacher_model_path: Some(dir.join("teacher.safetensors")),
        train_sets: vec![
            DistillSource {
                path: chexpert,
                dataset: DatasetName::Chexpert,
                nb_classes: Some(NUM_CLASSES),
            },
            DistillSource {
                path: nih,
                dataset: DatasetName::ChestXray14,
                nb_classes: Some(2),
            },
        ],
        ..Default::default()
    };
    Ok(config)
}

#[test]
fn test_distill_run_saves_on_interval_and_logs_train_only() -> Result<()> {
    let dir = TempDir::new()?;
    let config = distill_config(dir.path())?;
    let teacher = save_teacher(&dir.path().join("teacher.safetensors"))?;

    let mut trainer = DistillTrainer::from_config(config, ExecutionContext::single(Device::Cpu))?;
    assert_eq!(snapshot(trainer.teacher())?, snapshot(&teacher)?);
    let student_before = snapshot(trainer.model())?;

    let summary = trainer.run()?;

    // 24 samples at batch 2 give 12 micro-batches; accum_iter 4 flushes three times per epoch.
    assert_eq!(summary.epochs_run, vec![0, 1, 2]);
    assert_eq!(summary.optimizer_steps, 9);
    assert!(summary.last_train_stats.is_some_and(|s| s["loss"].is_finite()));

    assert!(dir.path().join("checkpoint-0.bin").exists());
    assert!(!dir.path().join("checkpoint-1.bin").exists());
    assert!(dir.path().join("checkpoint-2.bin").exists());
    assert!(dir.path().join("config.yaml").exists());

    let entries = read_epoch_log(&dir.path().join(EPOCH_LOG))?;
    assert_eq!(entries.len(), 3);
    for (epoch, entry) in entries.iter().enumerate() {
        assert_eq!(entry["epoch"].as_u64(), Some(epoch as u64));
        assert!(entry["train_loss"].as_f64().is_some());
        assert!(entry.keys().all(|k| !k.starts_with("test_")));
    }

    assert_eq!(snapshot(trainer.teacher())?, snapshot(&teacher)?);
    assert_ne!(snapshot(trainer.model())?, student_before);
    Ok(())
}

#[test]
fn test_student_init_respects_weight_keywords() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = distill_config(dir.path())?;
    let teacher_path = dir.path().join("teacher.safetensors");
    let teacher = save_teacher(&teacher_path)?;
    config.distill.student_init_weights = Some(teacher_path);
    config.load_weights_keywords = Some(vec!["head.weight".to_string()]);

    let trainer = DistillTrainer::from_config(config, ExecutionContext::single(Device::Cpu))?;
    let student = snapshot(trainer.model())?;
    let teacher = snapshot(&teacher)?;
    let find = |params: &[(String, Vec<f32>)], name: &str| {
        params.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone())
    };
    assert_eq!(find(&student, "head.weight"), find(&teacher, "head.weight"));
    assert_ne!(find(&student, "head.bias"), find(&teacher, "head.bias"));
    Ok(())
}

#[test]
fn test_distill_requires_complete_teacher() -> Result<()> {
    let dir = TempDir::new()?;
    let config = distill_config(dir.path())?;
    let teacher = Classifier::new(ModelKind::LinearProbe, NUM_CLASSES, INPUT_SIZE, &Device::Cpu)?;
    let mut weights = teacher.state_dict();
    weights.remove("head.bias");
    candle_core::safetensors::save(&weights, dir.path().join("teacher.safetensors"))?;

    assert!(DistillTrainer::from_config(config, ExecutionContext::single(Device::Cpu)).is_err());
    Ok(())
}
