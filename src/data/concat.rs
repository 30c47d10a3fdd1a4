//! Several datasets served as one

use std::sync::Arc;

use candle_core::{DType, Tensor};

use super::{Batch, Dataset};
use crate::error::{Error, Result};
use crate::training::auroc::one_hot;

/// Datasets indexed back to back, in the order given
///
/// Members may differ in target width: every batch is served as dense
/// `[batch, num_classes]` rows, where `num_classes` is the widest member's
/// count and missing columns are zero.
pub struct ConcatDataset {
    members: Vec<Arc<dyn Dataset>>,
    ends: Vec<usize>,
    num_classes: usize,
}

impl ConcatDataset {
    /// Concatenate `members`; their images must share one sample shape
    pub fn new(members: Vec<Arc<dyn Dataset>>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::data("cannot concatenate zero datasets"));
        }

        let mut sample_dims: Option<Vec<usize>> = None;
        for member in members.iter().filter(|m| !m.is_empty()) {
            let dims = member.get_batch(&[0])?.images.dims()[1..].to_vec();
            match &sample_dims {
                Some(expected) if *expected != dims => {
                    return Err(Error::data(format!(
                        "image shapes differ across datasets: {:?} vs {:?}",
                        expected, dims
                    )))
                }
                Some(_) => {}
                None => sample_dims = Some(dims),
            }
        }

        let ends = members
            .iter()
            .scan(0, |total, m| {
                *total += m.len();
                Some(*total)
            })
            .collect();
        let num_classes = members.iter().map(|m| m.num_classes()).max().unwrap_or(0);
        Ok(Self {
            members,
            ends,
            num_classes,
        })
    }

    /// Member holding global sample `index`, with its local index
    fn locate(&self, index: usize) -> Result<(usize, usize)> {
        let member = self.ends.partition_point(|&end| end <= index);
        if member == self.members.len() {
            return Err(Error::data(format!(
                "sample index {} out of range for {} samples",
                index,
                self.len()
            )));
        }
        let start = if member == 0 { 0 } else { self.ends[member - 1] };
        Ok((member, index - start))
    }

    fn widen(&self, targets: &Tensor, width: usize) -> Result<Tensor> {
        let dense = if targets.rank() == 1 {
            let indices = targets.to_dtype(DType::U32)?.to_vec1::<u32>()?;
            let rows = one_hot(&indices, width)?;
            let shape = rows.dim();
            Tensor::from_vec(rows.iter().copied().collect::<Vec<f32>>(), shape, targets.device())?
        } else {
            targets.to_dtype(DType::F32)?
        };
        if width == self.num_classes {
            return Ok(dense);
        }
        Ok(dense.pad_with_zeros(1, 0, self.num_classes - width)?)
    }
}

impl Dataset for ConcatDataset {
    fn len(&self) -> usize {
        self.ends.last().copied().unwrap_or(0)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn get_batch(&self, indices: &[usize]) -> Result<Batch> {
        // runs of consecutive indices that fall in the same member
        let mut runs: Vec<(usize, Vec<usize>)> = Vec::new();
        for &index in indices {
            let (member, local) = self.locate(index)?;
            match runs.last_mut() {
                Some((m, locals)) if *m == member => locals.push(local),
                _ => runs.push((member, vec![local])),
            }
        }

        let mut images = Vec::with_capacity(runs.len());
        let mut targets = Vec::with_capacity(runs.len());
        for (member, locals) in &runs {
            let dataset = &self.members[*member];
            let batch = dataset.get_batch(locals)?;
            targets.push(self.widen(&batch.targets, dataset.num_classes())?);
            images.push(batch.images);
        }

        Ok(Batch {
            images: Tensor::cat(&images, 0)?,
            targets: Tensor::cat(&targets, 0)?,
        })
    }
}
