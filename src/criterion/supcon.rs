use ndarray::{Array2, Array3, Axis};

use crate::error::{Result, VoxprofileError};

/// Supervised contrastive loss over multi-view features (contrast mode "all").
///
/// Features are `[batch, views, dim]`. Without labels every example's other
/// views are its only positives, which reduces to the SimCLR objective.
#[derive(Debug, Clone, Copy)]
pub struct SupConLoss {
    pub temperature: f64,
    pub base_temperature: f64,
}

impl Default for SupConLoss {
    fn default() -> Self {
        Self {
            temperature: 0.07,
            base_temperature: 0.07,
        }
    }
}

impl SupConLoss {
    #[must_use]
    pub const fn new(temperature: f64, base_temperature: f64) -> Self {
        Self {
            temperature,
            base_temperature,
        }
    }

    pub fn compute(&self, features: &Array3<f32>, labels: Option<&[usize]>) -> Result<f64> {
        let (bsz, views, dim) = features.dim();
        if bsz == 0 || views == 0 {
            return Err(VoxprofileError::Criterion(
                "contrastive loss needs at least one example and one view".to_string(),
            ));
        }
        if let Some(labels) = labels
            && labels.len() != bsz
        {
            return Err(VoxprofileError::Criterion(format!(
                "contrastive loss got {} labels for {bsz} examples",
                labels.len()
            )));
        }

        // View-major stacking: row k is view k / bsz of example k % bsz.
        let n = bsz * views;
        let mut contrast = Array2::<f64>::zeros((n, dim));
        for v in 0..views {
            let view = features.index_axis(Axis(1), v);
            contrast
                .slice_mut(ndarray::s![v * bsz..(v + 1) * bsz, ..])
                .assign(&view.mapv(f64::from));
        }

        let logits = contrast.dot(&contrast.t()) / self.temperature;

        let same_class = |i: usize, j: usize| match labels {
            Some(labels) => labels[i % bsz] == labels[j % bsz],
            None => i % bsz == j % bsz,
        };

        let mut total = 0.0;
        for (i, row) in logits.outer_iter().enumerate() {
            let row_max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            let denom = row
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, &l)| (l - row_max).exp())
                .sum::<f64>()
                .ln();

            let mut pos_sum = 0.0;
            let mut pos_count = 0usize;
            for (j, &l) in row.iter().enumerate() {
                if j != i && same_class(i, j) {
                    pos_sum += (l - row_max) - denom;
                    pos_count += 1;
                }
            }

            let mean_log_prob_pos = pos_sum / pos_count.max(1) as f64;
            total += -(self.temperature / self.base_temperature) * mean_log_prob_pos;
        }

        Ok(total / n as f64)
    }
}
