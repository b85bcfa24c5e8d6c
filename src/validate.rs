use std::path::Path;

use crate::config::Config;
use crate::criterion::{Criterion, LoggingOutput, Sample, create_criterion};
use crate::dataset::FeatureDataset;
use crate::dataset::loader::DataLoader;
use crate::error::Result;
use crate::metrics::{Meters, gather_logging_outputs};
use crate::model::{Classifier, InferenceContext};

/// Score every batch of `dataset` with `criterion` and reduce the pooled
/// logging outputs into meters.
///
/// Reduction runs once over everything gathered; the weighted meters give the
/// same result as reducing per step, and ranking metrics see every example.
pub fn validate(
    classifier: &mut dyn Classifier,
    criterion: &dyn Criterion,
    dataset: &FeatureDataset,
    batch_size: usize,
) -> Result<Meters> {
    let loader = DataLoader::new(dataset, batch_size);
    let mut logging_outputs: Vec<LoggingOutput> = Vec::with_capacity(loader.num_batches());

    for batch in loader {
        let batch = batch?;
        let net_output = classifier.classify(&batch, criterion.encoder_contrastive())?;
        let sample = Sample::from_batch(&batch);
        let output = criterion.forward(&net_output, &sample)?;
        tracing::trace!(
            "batch of {}: loss={:.4} sample_size={}",
            batch.len(),
            output.loss,
            output.sample_size
        );
        logging_outputs.push(output.logging_output);
    }

    // Single process: this worker's outputs are the whole pool.
    let pooled = gather_logging_outputs(
        vec![logging_outputs],
        criterion.logging_outputs_can_be_summed(),
    );

    let mut meters = Meters::new();
    criterion.reduce_metrics(&pooled, &mut meters);
    Ok(meters)
}

/// Load the checkpoint, the manifests and the configured criterion, then run
/// [`validate`].
pub fn run_validation(config: &Config, checkpoint: &Path) -> Result<Meters> {
    let criterion = create_criterion(config)?;
    tracing::info!("validating with criterion '{}'", criterion.name());

    let mut context = InferenceContext::new(checkpoint, &config.model)?;
    let dataset = FeatureDataset::from_manifests(&config.manifests, &config.dataset.feature_suffix)?;

    validate(
        &mut context,
        criterion.as_ref(),
        &dataset,
        config.validate.batch_size,
    )
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, ArrayD, IxDyn};

    use super::*;
    use crate::criterion::NetOutput;
    use crate::dataset::FeatureRecord;
    use crate::dataset::collate::Batch;

    /// Predicts class 1 when the first feature value is positive.
    struct SignClassifier;

    impl Classifier for SignClassifier {
        fn classify(&mut self, batch: &Batch, encoder_contrastive: bool) -> Result<NetOutput> {
            let logits = Array2::from_shape_fn((batch.len(), 2), |(i, c)| {
                let v = batch.features[[i, 0, 0]];
                if c == 1 { v } else { -v }
            });
            if !encoder_contrastive {
                return Ok(NetOutput::Logits(logits));
            }
            let (b, bins, frames) = batch.features.dim();
            let flat = ArrayD::from_shape_vec(
                IxDyn(&[b, bins, frames]),
                batch.features.iter().copied().collect(),
            )
            .unwrap_or_else(|e| panic!("{e}"));
            Ok(NetOutput::EncoderContrastive {
                ae_input: flat.clone(),
                ae_hidden: logits.clone(),
                cnn_hidden: logits.clone(),
                ae_output: flat,
                logits,
            })
        }
    }

    fn dataset() -> FeatureDataset {
        let values = [(2.0f32, 1), (-1.0, 0), (0.5, 0), (-3.0, 0), (1.5, 1)];
        FeatureDataset::from_records(
            values
                .iter()
                .enumerate()
                .map(|(i, &(v, label))| FeatureRecord {
                    id: format!("u{i}"),
                    features: Array2::from_elem((3, i + 1), v),
                    label,
                })
                .collect(),
        )
    }

    #[test]
    fn reports_pooled_accuracy() {
        let config = Config::default();
        let criterion = create_criterion(&config).unwrap_or_else(|e| panic!("{e}"));
        let meters = validate(&mut SignClassifier, criterion.as_ref(), &dataset(), 2)
            .unwrap_or_else(|e| panic!("{e}"));

        // Only the 0.5 / label 0 utterance is misclassified.
        assert_eq!(meters.get_smoothed_value("accuracy"), Some(80.0));
        assert!(meters.get_smoothed_value("loss").is_some_and(|l| l > 0.0));
        assert!(meters.get_smoothed_value("ppl").is_some());
        assert!(meters.get_smoothed_value("nll_loss").is_none());
        assert!(meters.get_smoothed_value("auc").is_some());
    }

    #[test]
    fn batch_size_does_not_change_metrics() {
        let config = Config::default();
        let criterion = create_criterion(&config).unwrap_or_else(|e| panic!("{e}"));
        let ds = dataset();

        let one = validate(&mut SignClassifier, criterion.as_ref(), &ds, 1)
            .unwrap_or_else(|e| panic!("{e}"));
        let all = validate(&mut SignClassifier, criterion.as_ref(), &ds, 5)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(one.smoothed_values(), all.smoothed_values());
    }

    #[test]
    fn contrastive_mode_uses_fused_outputs() {
        let mut config = Config::default();
        config.criterion.encoder_contrastive = true;
        let criterion = create_criterion(&config).unwrap_or_else(|e| panic!("{e}"));
        let meters = validate(&mut SignClassifier, criterion.as_ref(), &dataset(), 5)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(meters.get_smoothed_value("accuracy"), Some(80.0));
    }
}
