use ndarray::{Array2, Array3, s};

use crate::error::{Result, VoxprofileError};

use super::FeatureRecord;

/// A padded minibatch.
///
/// `features` is `[batch, bins, max_len]`; every example is zero-padded on the
/// time axis. `mask` is `[batch, max_len]` with 1 on original frames and 0 on
/// padding, so padded zeros are never mistaken for real data.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ids: Vec<String>,
    pub features: Array3<f32>,
    pub mask: Array2<i64>,
    pub labels: Vec<usize>,
    pub lengths: Vec<usize>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn max_len(&self) -> usize {
        self.mask.ncols()
    }
}

/// Stack records into a [`Batch`], padding each to the longest example.
pub fn collate(records: &[&FeatureRecord]) -> Result<Batch> {
    let Some(first) = records.first() else {
        return Err(VoxprofileError::Dataset("cannot collate an empty batch".to_string()));
    };

    let bins = first.num_bins();
    let max_len = records.iter().map(|r| r.num_frames()).max().unwrap_or(0);

    let mut features = Array3::<f32>::zeros((records.len(), bins, max_len));
    let mut mask = Array2::<i64>::zeros((records.len(), max_len));
    let mut ids = Vec::with_capacity(records.len());
    let mut labels = Vec::with_capacity(records.len());
    let mut lengths = Vec::with_capacity(records.len());

    for (i, record) in records.iter().enumerate() {
        if record.num_bins() != bins {
            return Err(VoxprofileError::Dataset(format!(
                "record '{}' has {} feature bins, batch expects {bins}",
                record.id,
                record.num_bins()
            )));
        }

        let frames = record.num_frames();
        features
            .slice_mut(s![i, .., ..frames])
            .assign(&record.features);
        mask.slice_mut(s![i, ..frames]).fill(1);

        ids.push(record.id.clone());
        labels.push(record.label);
        lengths.push(frames);
    }

    Ok(Batch {
        ids,
        features,
        mask,
        labels,
        lengths,
    })
}
