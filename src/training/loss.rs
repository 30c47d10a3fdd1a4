//! Training and evaluation criteria

use candle_core::{DType, Tensor};

use crate::config::DatasetName;
use crate::data::Batch;
use crate::error::{Error, Result};
use crate::model::{Classifier, LastActivation};

/// How one training batch becomes the scalar loss to minimize
pub trait TrainObjective: Send + Sync {
    /// Mean loss of `model` on `batch`, with gradient tracking
    fn loss(&self, model: &Classifier, batch: &Batch) -> Result<Tensor>;
}

/// The model's own logits scored against the batch targets
#[derive(Debug, Clone, Copy)]
pub struct Supervised {
    /// Training criterion
    pub criterion: Criterion,
    /// Activation applied before the criterion
    pub last_activation: Option<LastActivation>,
}

impl TrainObjective for Supervised {
    fn loss(&self, model: &Classifier, batch: &Batch) -> Result<Tensor> {
        let mut outputs = model.forward(&batch.images, true)?;
        if let Some(activation) = self.last_activation {
            outputs = activation.apply(&outputs)?;
        }
        self.criterion.compute(&outputs, &batch.targets)
    }
}

/// Loss function selected by dataset and augmentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    /// Binary cross entropy on logits with hard {0,1} targets
    BceWithLogits,
    /// Binary cross entropy on logits with mixed / smoothed targets
    SoftTargetBce,
    /// Softmax cross entropy with class indices or one-hot rows
    CrossEntropy,
}

impl Criterion {
    /// Training criterion for `dataset`
    pub fn for_training(dataset: DatasetName, mixup_active: bool) -> Self {
        match dataset {
            DatasetName::ChestXray14 if mixup_active => Self::SoftTargetBce,
            DatasetName::ChestXray14 => Self::BceWithLogits,
            DatasetName::Chexpert => Self::CrossEntropy,
        }
    }

    /// Evaluation criterion for `dataset`
    pub fn for_evaluation(dataset: DatasetName) -> Self {
        Self::for_training(dataset, false)
    }

    /// Mean loss over the batch
    pub fn compute(&self, outputs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        match self {
            Self::BceWithLogits | Self::SoftTargetBce => {
                let targets = dense_targets(targets, outputs.dim(1)?)?;
                binary_cross_entropy_with_logits(outputs, &targets)
            }
            Self::CrossEntropy => {
                if targets.rank() == 1 {
                    let targets = targets.to_dtype(DType::U32)?;
                    Ok(candle_nn::loss::cross_entropy(outputs, &targets)?)
                } else {
                    soft_cross_entropy(outputs, &targets.to_dtype(outputs.dtype())?)
                }
            }
        }
    }
}

/// `mean(max(x, 0) - x * y + log(1 + exp(-|x|)))`
pub fn binary_cross_entropy_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    if logits.dims() != targets.dims() {
        return Err(Error::data(format!(
            "logits {:?} and targets {:?} differ in shape",
            logits.dims(),
            targets.dims()
        )));
    }
    let targets = targets.to_dtype(logits.dtype())?;
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    let per_elem = ((logits.relu()? - (logits * &targets)?)? + softplus)?;
    Ok(per_elem.mean_all()?)
}

/// `mean_b(-sum_c y * log_softmax(x))`
pub fn soft_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, 1)?;
    let per_sample = (targets * log_probs)?.sum(1)?.neg()?;
    Ok(per_sample.mean_all()?)
}

fn dense_targets(targets: &Tensor, num_classes: usize) -> Result<Tensor> {
    if targets.rank() == 2 {
        return Ok(targets.clone());
    }
    let indices = targets.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let rows = crate::training::auroc::one_hot(&indices, num_classes)?;
    let (n, c) = rows.dim();
    let flat: Vec<f32> = rows.iter().copied().collect();
    Ok(Tensor::from_vec(flat, (n, c), targets.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn scalar(t: Tensor) -> f64 {
        t.to_dtype(DType::F64).unwrap().to_scalar::<f64>().unwrap()
    }

    #[test]
    fn test_criterion_selection() {
        assert_eq!(Criterion::for_training(DatasetName::ChestXray14, false), Criterion::BceWithLogits);
        assert_eq!(Criterion::for_training(DatasetName::ChestXray14, true), Criterion::SoftTargetBce);
        assert_eq!(Criterion::for_training(DatasetName::Chexpert, true), Criterion::CrossEntropy);
        assert_eq!(Criterion::for_evaluation(DatasetName::ChestXray14), Criterion::BceWithLogits);
    }

    #[test]
    fn test_bce_matches_closed_form() {
        let logits = Tensor::new(&[[0f32, 2.0], [-1.0, 0.5]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let loss = scalar(Criterion::BceWithLogits.compute(&logits, &targets).unwrap());

        let bce = |x: f64, y: f64| {
            let p = 1.0 / (1.0 + (-x).exp());
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        };
        let expected = (bce(0.0, 1.0) + bce(2.0, 0.0) + bce(-1.0, 0.0) + bce(0.5, 1.0)) / 4.0;
        assert_relative_eq!(loss, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_cross_entropy_indices_and_one_hot_agree() {
        let logits = Tensor::new(&[[1f32, 2.0, 0.5], [0.1, 0.2, 3.0]], &Device::Cpu).unwrap();
        let indices = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();
        let one_hot = Tensor::new(&[[0f32, 1.0, 0.0], [0.0, 0.0, 1.0]], &Device::Cpu).unwrap();
        let a = scalar(Criterion::CrossEntropy.compute(&logits, &indices).unwrap());
        let b = scalar(Criterion::CrossEntropy.compute(&logits, &one_hot).unwrap());
        assert_relative_eq!(a, b, epsilon = 1e-5);
    }

    #[test]
    fn test_bce_accepts_class_indices() {
        let logits = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let indices = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        let loss = scalar(Criterion::BceWithLogits.compute(&logits, &indices).unwrap());
        assert_relative_eq!(loss, std::f64::consts::LN_2, epsilon = 1e-5);
    }

    #[test]
    fn test_supervised_applies_last_activation() {
        let model = Classifier::new(crate::model::ModelKind::LinearProbe, 2, 2, &Device::Cpu).unwrap();
        let batch = Batch {
            images: Tensor::ones((2, 3, 2, 2), DType::F32, &Device::Cpu).unwrap(),
            targets: Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap(),
        };
        let plain = Supervised {
            criterion: Criterion::BceWithLogits,
            last_activation: None,
        };
        let activated = Supervised {
            last_activation: Some(LastActivation::Sigmoid),
            ..plain
        };

        let logits = model.forward(&batch.images, true).unwrap();
        let expected = scalar(Criterion::BceWithLogits.compute(&logits, &batch.targets).unwrap());
        assert_relative_eq!(scalar(plain.loss(&model, &batch).unwrap()), expected, epsilon = 1e-6);

        let probs = candle_nn::ops::sigmoid(&logits).unwrap();
        let expected = scalar(Criterion::BceWithLogits.compute(&probs, &batch.targets).unwrap());
        assert_relative_eq!(scalar(activated.loss(&model, &batch).unwrap()), expected, epsilon = 1e-6);
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let logits = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(binary_cross_entropy_with_logits(&logits, &targets).is_err());
    }
}
