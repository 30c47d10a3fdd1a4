//! Multi-label ROC AUC
//!
//! AUROC is rank-based and not batch-decomposable, so callers collect the
//! full prediction matrix before scoring. A class whose ground-truth column
//! holds a single label value has no defined AUROC; it is reported as the
//! sentinel `0.0` and left out of the mean.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Per-class score recorded when AUROC is undefined
pub const MISSING_CLASS_AUC: f64 = 0.0;

/// Reasons a single-column AUROC cannot be computed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AucError {
    /// Only one label value is present
    #[error("only one class present in y_true ({positives} positives of {total})")]
    SingleClass {
        /// Positive count
        positives: usize,
        /// Column length
        total: usize,
    },
    /// Label and score columns differ in length
    #[error("y_true has {0} entries but y_score has {1}")]
    LengthMismatch(usize, usize),
}

/// Rank-based ROC AUC of one binary column
///
/// Labels `>= 0.5` count as positive. Tied scores receive their average
/// rank, so the result equals the trapezoidal ROC area.
pub fn roc_auc_score(y_true: ArrayView1<f32>, y_score: ArrayView1<f32>) -> std::result::Result<f64, AucError> {
    let total = y_true.len();
    if y_score.len() != total {
        return Err(AucError::LengthMismatch(total, y_score.len()));
    }

    let positives = y_true.iter().filter(|&&y| y >= 0.5).count();
    let negatives = total - positives;
    if positives == 0 || negatives == 0 {
        return Err(AucError::SingleClass { positives, total });
    }

    let mut order: Vec<usize> = (0..total).collect();
    order.sort_by(|&a, &b| y_score[a].total_cmp(&y_score[b]));

    let mut rank_sum_pos = 0.0;
    let mut start = 0;
    while start < total {
        let mut end = start + 1;
        while end < total && y_score[order[end]] == y_score[order[start]] {
            end += 1;
        }
        // 1-based ranks start+1 ..= end share their mean
        let avg_rank = (start + 1 + end) as f64 / 2.0;
        let tied_pos = order[start..end].iter().filter(|&&i| y_true[i] >= 0.5).count();
        rank_sum_pos += avg_rank * tied_pos as f64;
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((rank_sum_pos - p * (p + 1.0) / 2.0) / (p * n))
}

/// AUROC summary over every class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AurocReport {
    /// One entry per class; [`MISSING_CLASS_AUC`] where undefined
    pub auc_each_class: Vec<f64>,
    /// Classes whose AUROC was undefined
    pub missing_classes_index: Vec<usize>,
    /// Mean over the defined classes; NaN if none is defined
    pub auc_avg: f64,
}

/// Score every class column of `y_true` against `y_pred`
pub fn compute_auroc(y_true: ArrayView2<f32>, y_pred: ArrayView2<f32>) -> Result<AurocReport> {
    if y_true.dim() != y_pred.dim() {
        return Err(Error::data(format!(
            "ground truth {:?} and predictions {:?} differ in shape",
            y_true.dim(),
            y_pred.dim()
        )));
    }
    let num_classes = y_true.ncols();

    let scores: Vec<std::result::Result<f64, AucError>> = (0..num_classes)
        .into_par_iter()
        .map(|c| roc_auc_score(y_true.index_axis(Axis(1), c), y_pred.index_axis(Axis(1), c)))
        .collect();

    let mut auc_each_class = Vec::with_capacity(num_classes);
    let mut missing_classes_index = Vec::new();
    for (class, score) in scores.into_iter().enumerate() {
        match score {
            Ok(auc) => auc_each_class.push(auc),
            Err(e) => {
                debug!("AUROC undefined for class {}: {}", class, e);
                auc_each_class.push(MISSING_CLASS_AUC);
                missing_classes_index.push(class);
            }
        }
    }

    if !missing_classes_index.is_empty() {
        warn!(
            "There are classes that were not predicted during testing, the indexes are: {:?}",
            missing_classes_index
        );
    }

    let defined: Vec<f64> = auc_each_class
        .iter()
        .enumerate()
        .filter(|(class, _)| !missing_classes_index.contains(class))
        .map(|(_, &auc)| auc)
        .collect();
    let auc_avg = defined.iter().sum::<f64>() / defined.len() as f64;

    Ok(AurocReport {
        auc_each_class,
        missing_classes_index,
        auc_avg,
    })
}

/// Percentage of label entries where `logit > 0` matches the target
pub fn multilabel_accuracy(y_true: ArrayView2<f32>, logits: ArrayView2<f32>) -> f64 {
    let total = y_true.len();
    if total == 0 {
        return f64::NAN;
    }
    let correct = y_true
        .iter()
        .zip(logits.iter())
        .filter(|&(&y, &z)| (z > 0.0) == (y >= 0.5))
        .count();
    100.0 * correct as f64 / total as f64
}

/// Expand class indices into one-hot rows
pub fn one_hot(indices: &[u32], num_classes: usize) -> Result<Array2<f32>> {
    let mut out = Array2::<f32>::zeros((indices.len(), num_classes));
    for (row, &class) in indices.iter().enumerate() {
        let class = class as usize;
        if class >= num_classes {
            return Err(Error::data(format!(
                "class index {} out of range for {} classes",
                class, num_classes
            )));
        }
        out[[row, class]] = 1.0;
    }
    Ok(out)
}
