pub mod cross_entropy;
pub mod supcon;

use ndarray::{Array2, ArrayD};
use serde::Serialize;

use crate::config::Config;
use crate::dataset::collate::Batch;
use crate::error::{Result, VoxprofileError};
use crate::metrics::Meters;

use self::cross_entropy::CrossEntropyCriterion;

/// Raw model output as seen by a criterion.
#[derive(Debug, Clone)]
pub enum NetOutput {
    /// Classification logits, `[batch, classes]`.
    Logits(Array2<f32>),

    /// Output of a model trained with the auxiliary autoencoder and
    /// contrastive objectives.
    EncoderContrastive {
        ae_input: ArrayD<f32>,
        ae_hidden: Array2<f32>,
        cnn_hidden: Array2<f32>,
        ae_output: ArrayD<f32>,
        logits: Array2<f32>,
    },
}

impl NetOutput {
    #[must_use]
    pub const fn logits(&self) -> &Array2<f32> {
        match self {
            Self::Logits(logits) | Self::EncoderContrastive { logits, .. } => logits,
        }
    }
}

/// Targets and size information for one forward call.
#[derive(Debug, Clone)]
pub struct Sample {
    pub target: Vec<usize>,
    pub ntokens: usize,
}

impl Sample {
    /// Every utterance counts as a single token.
    #[must_use]
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            target: batch.labels.clone(),
            ntokens: batch.len(),
        }
    }

    #[must_use]
    pub fn nsentences(&self) -> usize {
        self.target.len()
    }
}

/// Per-step metric record produced by one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoggingOutput {
    pub loss: f64,
    pub ntokens: usize,
    pub nsentences: usize,
    pub sample_size: usize,
    pub ncorrect: usize,
    /// Predicted probability of the positive class, one per example.
    pub predicts: Vec<f32>,
    pub targets: Vec<usize>,
}

impl LoggingOutput {
    /// Element-wise sum of the scalar fields. Per-example lists cannot be
    /// summed and are left empty.
    #[must_use]
    pub fn summed<'a>(outputs: impl IntoIterator<Item = &'a Self>) -> Self {
        outputs.into_iter().fold(Self::default(), |mut acc, log| {
            acc.loss += log.loss;
            acc.ntokens += log.ntokens;
            acc.nsentences += log.nsentences;
            acc.sample_size += log.sample_size;
            acc.ncorrect += log.ncorrect;
            acc
        })
    }
}

/// Result of a criterion forward call.
#[derive(Debug, Clone)]
pub struct CriterionOutput {
    pub loss: f64,
    /// Denominator for the gradient.
    pub sample_size: usize,
    pub logging_output: LoggingOutput,
}

/// A loss-and-metrics component.
pub trait Criterion {
    fn name(&self) -> &str;

    /// Compute the loss for one sample.
    fn forward(&self, net_output: &NetOutput, sample: &Sample) -> Result<CriterionOutput>;

    /// Aggregate logging outputs pooled from every worker into `meters`.
    fn reduce_metrics(&self, logging_outputs: &[LoggingOutput], meters: &mut Meters);

    /// Whether logging outputs may be summed across workers before
    /// [`Criterion::reduce_metrics`] is called.
    fn logging_outputs_can_be_summed(&self) -> bool;

    /// Whether the model is expected to produce
    /// [`NetOutput::EncoderContrastive`].
    fn encoder_contrastive(&self) -> bool {
        false
    }
}

pub const AVAILABLE_CRITERIA: &[&str] = &["cross_entropy"];

/// Create a criterion based on the config criterion name.
pub fn create_criterion(config: &Config) -> Result<Box<dyn Criterion>> {
    match config.criterion.name.as_str() {
        "cross_entropy" => Ok(Box::new(CrossEntropyCriterion::new(
            &config.criterion,
            config.sentence_avg(),
        )?)),
        other => Err(VoxprofileError::Criterion(format!(
            "unknown criterion: {other} (available: {})",
            AVAILABLE_CRITERIA.join(", ")
        ))),
    }
}
