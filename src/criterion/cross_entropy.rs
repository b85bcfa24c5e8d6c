use std::f64::consts::LN_2;

use ndarray::{Array2, Array3, ArrayD, Axis, stack};

use crate::config::CriterionConfig;
use crate::error::{Result, VoxprofileError};
use crate::metrics::{Meters, perplexity, roc_auc};

use super::supcon::SupConLoss;
use super::{Criterion, CriterionOutput, LoggingOutput, NetOutput, Sample};

/// Index of the class whose probability is reported in `predicts`.
const POSITIVE_CLASS: usize = 1;

/// Class-weighted negative log-likelihood over softmax-normalized logits,
/// optionally fused with autoencoder reconstruction and contrastive terms.
#[derive(Debug, Clone)]
pub struct CrossEntropyCriterion {
    sentence_avg: bool,
    class_weights: Vec<f64>,
    encoder_contrastive: bool,
    contrastive_weight: f64,
    supcon: SupConLoss,
}

impl CrossEntropyCriterion {
    pub fn new(config: &CriterionConfig, sentence_avg: bool) -> Result<Self> {
        if config.class_weights.len() < 2 {
            return Err(VoxprofileError::Config(format!(
                "criterion.class_weights needs at least 2 entries, got {}",
                config.class_weights.len()
            )));
        }

        Ok(Self {
            sentence_avg,
            class_weights: config.class_weights.iter().copied().map(f64::from).collect(),
            encoder_contrastive: config.encoder_contrastive,
            contrastive_weight: f64::from(config.contrastive_weight),
            supcon: SupConLoss::new(
                f64::from(config.temperature),
                f64::from(config.base_temperature),
            ),
        })
    }

    /// Returns the loss, the log-probabilities and the predicted classes.
    fn compute_loss(
        &self,
        net_output: &NetOutput,
        sample: &Sample,
    ) -> Result<(f64, Array2<f64>, Vec<usize>)> {
        match (net_output, self.encoder_contrastive) {
            (NetOutput::Logits(_), true) => {
                return Err(VoxprofileError::Criterion(
                    "encoder-contrastive mode expects autoencoder outputs alongside the logits"
                        .to_string(),
                ));
            }
            (NetOutput::EncoderContrastive { .. }, false) => {
                return Err(VoxprofileError::Criterion(
                    "model produced encoder-contrastive outputs but the mode is disabled"
                        .to_string(),
                ));
            }
            _ => {}
        }

        let lprobs = log_softmax(net_output.logits());
        let (rows, classes) = lprobs.dim();

        if sample.target.len() != rows {
            return Err(VoxprofileError::Criterion(format!(
                "model produced {rows} rows of logits for {} targets",
                sample.target.len()
            )));
        }
        if classes != self.class_weights.len() {
            return Err(VoxprofileError::Criterion(format!(
                "model produced {classes} classes but {} class weights are configured",
                self.class_weights.len()
            )));
        }

        let mut loss = 0.0;
        for (row, &target) in lprobs.outer_iter().zip(&sample.target) {
            if target >= classes {
                return Err(VoxprofileError::Criterion(format!(
                    "target class {target} out of range for {classes} classes"
                )));
            }
            loss += self.class_weights[target] * -row[target];
        }

        if let NetOutput::EncoderContrastive {
            ae_input,
            ae_hidden,
            cnn_hidden,
            ae_output,
            ..
        } = net_output
        {
            let ae_loss = mse(ae_output, ae_input)?;
            let pairs = stack_views(ae_hidden, cnn_hidden)?;
            let cl_loss = self.supcon.compute(&pairs, None)?;
            tracing::trace!("nll={loss:.6} ae={ae_loss:.6} supcon={cl_loss:.6}");
            loss = self.contrastive_weight.mul_add(cl_loss, ae_loss + loss);
        }

        let preds = lprobs
            .outer_iter()
            .map(|row| argmax(row.iter().copied()))
            .collect();

        Ok((loss, lprobs, preds))
    }
}

impl Criterion for CrossEntropyCriterion {
    fn name(&self) -> &str {
        "cross_entropy"
    }

    fn forward(&self, net_output: &NetOutput, sample: &Sample) -> Result<CriterionOutput> {
        let (loss, lprobs, preds) = self.compute_loss(net_output, sample)?;

        let sample_size = if self.sentence_avg {
            sample.nsentences()
        } else {
            sample.ntokens
        };

        let ncorrect = preds
            .iter()
            .zip(&sample.target)
            .filter(|(p, t)| p == t)
            .count();

        let predicts = lprobs
            .column(POSITIVE_CLASS)
            .iter()
            .map(|&lp| lp.exp() as f32)
            .collect();

        let logging_output = LoggingOutput {
            loss,
            ntokens: sample.ntokens,
            nsentences: sample.nsentences(),
            sample_size,
            ncorrect,
            predicts,
            targets: sample.target.clone(),
        };

        Ok(CriterionOutput {
            loss,
            sample_size,
            logging_output,
        })
    }

    fn reduce_metrics(&self, logging_outputs: &[LoggingOutput], meters: &mut Meters) {
        let loss_sum: f64 = logging_outputs.iter().map(|log| log.loss).sum();
        let ntokens: usize = logging_outputs.iter().map(|log| log.ntokens).sum();
        let sample_size: usize = logging_outputs.iter().map(|log| log.sample_size).sum();

        // Divide by ln 2 to report the loss in base 2.
        if sample_size > 0 {
            meters.log_scalar(
                "loss",
                loss_sum / sample_size as f64 / LN_2,
                sample_size as f64,
                3,
            );
        }

        if sample_size == ntokens {
            if sample_size > 0 {
                meters.log_derived("ppl", |m| m.avg("loss").map_or(f64::NAN, perplexity));
            }
        } else if ntokens > 0 {
            meters.log_scalar("nll_loss", loss_sum / ntokens as f64 / LN_2, ntokens as f64, 3);
            meters.log_derived("ppl", |m| m.avg("nll_loss").map_or(f64::NAN, perplexity));
        }

        let ncorrect: usize = logging_outputs.iter().map(|log| log.ncorrect).sum();
        let nsentences: usize = logging_outputs.iter().map(|log| log.nsentences).sum();
        if nsentences > 0 {
            meters.log_scalar(
                "accuracy",
                100.0 * ncorrect as f64 / nsentences as f64,
                nsentences as f64,
                3,
            );
        } else {
            tracing::debug!("no sentences in logging outputs, skipping accuracy");
        }

        let predicts: Vec<f32> = logging_outputs
            .iter()
            .flat_map(|log| log.predicts.iter().copied())
            .collect();
        let targets: Vec<usize> = logging_outputs
            .iter()
            .flat_map(|log| log.targets.iter().copied())
            .collect();
        if let Some(auc) = roc_auc(&predicts, &targets, POSITIVE_CLASS) {
            meters.log_scalar("auc", auc, nsentences as f64, 3);
        }
    }

    /// Per-example predictions have to be gathered, not summed.
    fn logging_outputs_can_be_summed(&self) -> bool {
        false
    }

    fn encoder_contrastive(&self) -> bool {
        self.encoder_contrastive
    }
}

/// Row-wise log-softmax, computed in `f64`.
fn log_softmax(logits: &Array2<f32>) -> Array2<f64> {
    let mut out = logits.mapv(f64::from);
    for mut row in out.outer_iter_mut() {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let lse = row.iter().map(|&v| (v - max).exp()).sum::<f64>().ln() + max;
        row.mapv_inplace(|v| v - lse);
    }
    out
}

/// Index of the first maximum.
fn argmax(values: impl Iterator<Item = f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

fn mse(output: &ArrayD<f32>, input: &ArrayD<f32>) -> Result<f64> {
    if output.shape() != input.shape() {
        return Err(VoxprofileError::Criterion(format!(
            "autoencoder output shape {:?} does not match input shape {:?}",
            output.shape(),
            input.shape()
        )));
    }
    if output.is_empty() {
        return Err(VoxprofileError::Criterion(
            "autoencoder output is empty".to_string(),
        ));
    }

    let sum: f64 = output
        .iter()
        .zip(input.iter())
        .map(|(&o, &i)| (f64::from(o) - f64::from(i)).powi(2))
        .sum();
    Ok(sum / output.len() as f64)
}

/// Stack two `[batch, dim]` representations into `[batch, 2, dim]`.
fn stack_views(first: &Array2<f32>, second: &Array2<f32>) -> Result<Array3<f32>> {
    stack(Axis(1), &[first.view(), second.view()]).map_err(|e| {
        VoxprofileError::Criterion(format!(
            "cannot pair hidden representations {:?} and {:?}: {e}",
            first.dim(),
            second.dim()
        ))
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{IxDyn, array};

    use super::*;

    fn criterion(sentence_avg: bool, encoder_contrastive: bool) -> CrossEntropyCriterion {
        let config = CriterionConfig {
            encoder_contrastive,
            ..CriterionConfig::default()
        };
        CrossEntropyCriterion::new(&config, sentence_avg).unwrap_or_else(|e| panic!("{e}"))
    }

    fn sample(target: Vec<usize>) -> Sample {
        let ntokens = target.len();
        Sample { target, ntokens }
    }

    fn loss_of(c: &CrossEntropyCriterion, out: &NetOutput, target: Vec<usize>) -> f64 {
        c.forward(out, &sample(target))
            .unwrap_or_else(|e| panic!("{e}"))
            .loss
    }

    #[test]
    fn minority_class_is_weighted_seven_times() {
        let c = criterion(false, false);
        // Both batches give the target class the same log-probability.
        let majority_out = NetOutput::Logits(array![[0.3f32, -1.2], [0.3, -1.2], [0.3, -1.2]]);
        let minority_out = NetOutput::Logits(array![[-1.2f32, 0.3], [-1.2, 0.3], [-1.2, 0.3]]);

        let majority = loss_of(&c, &majority_out, vec![0, 0, 0]);
        let minority = loss_of(&c, &minority_out, vec![1, 1, 1]);
        assert!(majority > 0.0);
        assert!((minority / majority - 7.0).abs() < 1e-9);
    }

    #[test]
    fn nll_matches_hand_computation() {
        let c = criterion(false, false);
        let out = NetOutput::Logits(array![[0.0f32, 0.0], [2.0, 0.0]]);
        let loss = loss_of(&c, &out, vec![1, 0]);

        let lse = (2.0f64.exp() + 1.0).ln();
        let expected = 7.0 * 2.0f64.ln() + (lse - 2.0);
        assert!((loss - expected).abs() < 1e-9);
    }

    #[test]
    fn forward_reports_predictions() {
        let c = criterion(false, false);
        let out = NetOutput::Logits(array![[2.0f32, 0.0], [0.0, 3.0], [1.0, 0.5]]);
        let result = c.forward(&out, &sample(vec![0, 1, 1])).unwrap_or_else(|e| panic!("{e}"));
        let log = &result.logging_output;

        assert_eq!(log.ncorrect, 2);
        assert_eq!(log.nsentences, 3);
        assert_eq!(log.targets, vec![0, 1, 1]);
        assert_eq!(log.predicts.len(), 3);
        let p1 = 1.0 / (1.0 + (-3.0f32).exp());
        assert!((log.predicts[1] - p1).abs() < 1e-6);
        assert!((result.loss - log.loss).abs() < f64::EPSILON);
    }

    #[test]
    fn sample_size_follows_sentence_avg() {
        let out = NetOutput::Logits(array![[1.0f32, 0.0], [0.0, 1.0]]);
        let s = Sample {
            target: vec![0, 1],
            ntokens: 40,
        };

        let by_tokens = criterion(false, false).forward(&out, &s).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(by_tokens.sample_size, 40);

        let by_sentences = criterion(true, false).forward(&out, &s).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(by_sentences.sample_size, 2);
    }

    #[test]
    fn auxiliary_terms_are_added_in_contrastive_mode() {
        let logits = array![[0.5f32, -0.5], [-0.5, 0.5]];
        let plain = loss_of(&criterion(false, false), &NetOutput::Logits(logits.clone()), vec![0, 1]);

        let ae_input = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0f32, 2.0, 3.0, 4.0])
            .unwrap_or_else(|e| panic!("{e}"));
        let ae_output = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0f32, 2.0, 3.0, 6.0])
            .unwrap_or_else(|e| panic!("{e}"));
        let out = NetOutput::EncoderContrastive {
            ae_input,
            ae_hidden: array![[1.0f32, 0.0], [0.0, 1.0]],
            cnn_hidden: array![[1.0f32, 0.0], [0.0, 1.0]],
            ae_output,
            logits,
        };
        let fused = loss_of(&criterion(false, true), &out, vec![0, 1]);

        let features = array![[[1.0f32, 0.0], [1.0, 0.0]], [[0.0, 1.0], [0.0, 1.0]]];
        let cl = SupConLoss::default().compute(&features, None).unwrap_or_else(|e| panic!("{e}"));
        let expected = plain + 1.0 + 0.0005 * cl;
        assert!((fused - expected).abs() < 1e-6, "fused = {fused}, expected = {expected}");
    }

    #[test]
    fn output_variant_must_match_mode() {
        let logits = array![[0.5f32, -0.5]];
        let err = criterion(false, true)
            .forward(&NetOutput::Logits(logits), &sample(vec![0]))
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("encoder-contrastive"));
    }

    #[test]
    fn target_count_mismatch_is_an_error() {
        let out = NetOutput::Logits(array![[0.5f32, -0.5]]);
        assert!(criterion(false, false).forward(&out, &sample(vec![0, 1])).is_err());
    }

    #[test]
    fn out_of_range_target_is_an_error() {
        let out = NetOutput::Logits(array![[0.5f32, -0.5]]);
        assert!(criterion(false, false).forward(&out, &sample(vec![2])).is_err());
    }

    #[test]
    fn reduce_reports_accuracy_and_base2_loss() {
        let c = criterion(false, false);
        let logs = vec![
            LoggingOutput {
                loss: 2.0,
                ntokens: 4,
                nsentences: 4,
                sample_size: 4,
                ncorrect: 3,
                predicts: vec![0.9, 0.2, 0.8, 0.1],
                targets: vec![1, 0, 1, 0],
            },
            LoggingOutput {
                loss: 1.0,
                ntokens: 4,
                nsentences: 4,
                sample_size: 4,
                ncorrect: 2,
                predicts: vec![0.7, 0.3, 0.6, 0.4],
                targets: vec![1, 0, 0, 1],
            },
        ];
        let mut meters = Meters::new();
        c.reduce_metrics(&logs, &mut meters);

        let loss = 3.0 / 8.0 / LN_2;
        assert_eq!(meters.get_smoothed_value("loss"), Some((loss * 1000.0).round() / 1000.0));
        assert_eq!(meters.get_smoothed_value("accuracy"), Some(62.5));
        assert!(meters.get_smoothed_value("nll_loss").is_none());

        let ppl = meters.get_smoothed_value("ppl").unwrap_or_default();
        assert!((ppl - (2.0f64.powf(loss) * 100.0).round() / 100.0).abs() < 1e-9);
        assert!(meters.get_smoothed_value("auc").is_some());
    }

    #[test]
    fn reduce_logs_nll_loss_when_normalized_by_sentences() {
        let c = criterion(true, false);
        let logs = vec![LoggingOutput {
            loss: 4.0,
            ntokens: 8,
            nsentences: 2,
            sample_size: 2,
            ncorrect: 1,
            predicts: vec![0.5, 0.5],
            targets: vec![0, 0],
        }];
        let mut meters = Meters::new();
        c.reduce_metrics(&logs, &mut meters);

        let nll = meters.avg("nll_loss").unwrap_or_default();
        assert!((nll - 4.0 / 8.0 / LN_2).abs() < 1e-12);
        let ppl = meters.get_smoothed_value("ppl").unwrap_or_default();
        assert!((ppl - (2.0f64.powf(nll) * 100.0).round() / 100.0).abs() < 1e-9);
        assert_eq!(meters.get_smoothed_value("accuracy"), Some(50.0));
        // Only one class present.
        assert!(meters.get_smoothed_value("auc").is_none());
    }

    #[test]
    fn accuracy_is_ratio_of_pooled_counts() {
        let c = criterion(false, false);
        for (ncorrect, nsentences) in [(0, 5), (5, 5), (7, 9), (1, 3)] {
            let logs = vec![LoggingOutput {
                ncorrect,
                nsentences,
                ntokens: nsentences,
                sample_size: nsentences,
                ..LoggingOutput::default()
            }];
            let mut meters = Meters::new();
            c.reduce_metrics(&logs, &mut meters);
            let expected = 100.0 * ncorrect as f64 / nsentences as f64;
            let accuracy = meters.avg("accuracy").unwrap_or_default();
            assert!((accuracy - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_pool_logs_no_metrics() {
        let c = criterion(false, false);
        let mut meters = Meters::new();
        c.reduce_metrics(&[], &mut meters);

        assert!(meters.get_smoothed_value("loss").is_none());
        assert!(meters.get_smoothed_value("ppl").is_none());
        assert!(meters.is_empty());
    }

    #[test]
    fn zero_tokens_skip_nll_and_ppl() {
        let c = criterion(true, false);
        let logs = vec![LoggingOutput {
            loss: 1.0,
            ntokens: 0,
            nsentences: 2,
            sample_size: 2,
            ncorrect: 1,
            ..LoggingOutput::default()
        }];
        let mut meters = Meters::new();
        c.reduce_metrics(&logs, &mut meters);

        assert!(meters.get_smoothed_value("loss").is_some());
        assert!(meters.get_smoothed_value("nll_loss").is_none());
        assert!(meters.get_smoothed_value("ppl").is_none());
    }
}
