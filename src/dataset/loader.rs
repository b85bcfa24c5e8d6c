use crate::error::Result;

use super::FeatureDataset;
use super::collate::{Batch, collate};

/// Sequential, non-shuffling batch iterator over a [`FeatureDataset`].
pub struct DataLoader<'a> {
    dataset: &'a FeatureDataset,
    batch_size: usize,
    position: usize,
}

impl<'a> DataLoader<'a> {
    /// A `batch_size` of zero is treated as one.
    #[must_use]
    pub fn new(dataset: &'a FeatureDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            position: 0,
        }
    }

    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches this loader yields in total.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }
}

impl Iterator for DataLoader<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let records = self.dataset.records();
        if self.position >= records.len() {
            return None;
        }

        let end = (self.position + self.batch_size).min(records.len());
        let chunk: Vec<_> = records[self.position..end].iter().collect();
        self.position = end;

        Some(collate(&chunk))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::dataset::FeatureRecord;

    fn dataset(n: usize) -> FeatureDataset {
        FeatureDataset::from_records(
            (0..n)
                .map(|i| FeatureRecord {
                    id: format!("id{i}"),
                    features: Array2::zeros((2, i + 1)),
                    label: i % 2,
                })
                .collect(),
        )
    }

    #[test]
    fn yields_batches_in_order() {
        let ds = dataset(5);
        let loader = DataLoader::new(&ds, 2);
        assert_eq!(loader.num_batches(), 3);

        let batches: Vec<Batch> = loader
            .map(|b| b.unwrap_or_else(|e| panic!("{e}")))
            .collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].ids, vec!["id0".to_string(), "id1".to_string()]);
        assert_eq!(batches[2].ids, vec!["id4".to_string()]);
        assert_eq!(batches[1].max_len(), 4);
    }

    #[test]
    fn batch_size_one_yields_every_record() {
        let ds = dataset(3);
        let count = DataLoader::new(&ds, 1).count();
        assert_eq!(count, 3);
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let ds = dataset(2);
        assert_eq!(DataLoader::new(&ds, 0).batch_size(), 1);
    }

    #[test]
    fn empty_dataset_yields_nothing() {
        let ds = FeatureDataset::default();
        assert!(DataLoader::new(&ds, 4).next().is_none());
    }
}
