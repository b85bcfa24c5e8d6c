use std::path::Path;

use ndarray::{Array2, ArrayD, Axis, Ix2, IxDyn};
use ort::session::Session;

use crate::config::ModelConfig;
use crate::criterion::NetOutput;
use crate::dataset::collate::Batch;
use crate::error::{Result, VoxprofileError};

/// Features-only forward pass used for embedding extraction.
pub trait Encoder {
    /// Returns the encoder output for a single-example batch as
    /// `[frames, dim]`.
    fn encode(&mut self, batch: &Batch) -> Result<Array2<f32>>;
}

/// Full forward pass producing classification logits.
pub trait Classifier {
    /// In encoder-contrastive mode the model exposes the autoencoder tensors
    /// alongside the logits and a [`NetOutput::EncoderContrastive`] is returned.
    fn classify(&mut self, batch: &Batch, encoder_contrastive: bool) -> Result<NetOutput>;
}

/// Load an ONNX checkpoint.
pub fn load_model(model_path: &Path, gpu: bool) -> Result<Session> {
    if !model_path.exists() {
        return Err(VoxprofileError::Model(format!(
            "checkpoint not found: {}",
            model_path.display()
        )));
    }

    let builder = Session::builder()
        .map_err(|e| VoxprofileError::Model(format!("failed to create session builder: {e}")))?;

    #[cfg(feature = "cuda")]
    let builder = if gpu {
        use ort::ep::CUDA;
        builder
            .with_execution_providers([CUDA::default().build()])
            .map_err(|e| {
                VoxprofileError::Model(format!("failed to register CUDA execution provider: {e}"))
            })?
    } else {
        builder
    };

    #[cfg(feature = "rocm")]
    let builder = if gpu {
        use ort::ep::ROCm;
        builder
            .with_execution_providers([ROCm::default().build()])
            .map_err(|e| {
                VoxprofileError::Model(format!("failed to register ROCm execution provider: {e}"))
            })?
    } else {
        builder
    };

    #[cfg(not(any(feature = "cuda", feature = "rocm")))]
    let _ = gpu;

    builder
        .commit_from_file(model_path)
        .map_err(|e| VoxprofileError::Model(format!("failed to load checkpoint: {e}")))
}

/// A loaded model plus the tensor names it is driven with.
///
/// Passed explicitly to the profile and validation loops; nothing about the
/// model or its device lives in global state.
pub struct InferenceContext {
    session: Session,
    gpu: bool,
    features_input: String,
    mask_input: String,
    embedding_output: String,
    logits_output: String,
    contrastive_outputs: Vec<String>,
}

impl InferenceContext {
    pub fn new(model_path: &Path, config: &ModelConfig) -> Result<Self> {
        let session = load_model(model_path, config.gpu)?;

        if config.contrastive_outputs.len() != 5 {
            return Err(VoxprofileError::Config(format!(
                "model.contrastive_outputs must name 5 outputs, got {}",
                config.contrastive_outputs.len()
            )));
        }

        tracing::debug!("loaded checkpoint {}", model_path.display());

        Ok(Self {
            session,
            gpu: config.gpu,
            features_input: config.features_input.clone(),
            mask_input: config.mask_input.clone(),
            embedding_output: config.embedding_output.clone(),
            logits_output: config.logits_output.clone(),
            contrastive_outputs: config.contrastive_outputs.clone(),
        })
    }

    #[must_use]
    pub const fn gpu(&self) -> bool {
        self.gpu
    }

    /// Run the session on one batch and extract the named outputs.
    ///
    /// Features are fed as `[batch, bins, frames]` and the mask as
    /// `[batch, 1, frames]`.
    fn run(&mut self, batch: &Batch, names: &[String]) -> Result<Vec<ArrayD<f32>>> {
        let (b, bins, frames) = batch.features.dim();

        let features = ort::value::Tensor::from_array((
            [b, bins, frames],
            batch.features.iter().copied().collect::<Vec<f32>>(),
        ))
        .map_err(|e| VoxprofileError::Model(format!("failed to create feature tensor: {e}")))?;

        let mask = ort::value::Tensor::from_array((
            [b, 1usize, frames],
            batch.mask.iter().copied().collect::<Vec<i64>>(),
        ))
        .map_err(|e| VoxprofileError::Model(format!("failed to create mask tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![
                self.features_input.as_str() => features,
                self.mask_input.as_str() => mask,
            ])
            .map_err(|e| VoxprofileError::Model(format!("model inference failed: {e}")))?;

        names
            .iter()
            .map(|name| {
                let value = outputs.get(name.as_str()).ok_or_else(|| {
                    VoxprofileError::Model(format!("model has no output named '{name}'"))
                })?;
                let (shape, data) = value.try_extract_tensor::<f32>().map_err(|e| {
                    VoxprofileError::Model(format!("failed to extract output '{name}': {e}"))
                })?;
                let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
                ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(|e| {
                    VoxprofileError::Model(format!("failed to reshape output '{name}': {e}"))
                })
            })
            .collect()
    }
}

/// Drop a leading batch axis of size one and view the rest as 2-D.
fn squeeze_to_2d(array: ArrayD<f32>, what: &str) -> Result<Array2<f32>> {
    let array = if array.ndim() == 3 && array.shape()[0] == 1 {
        array.index_axis_move(Axis(0), 0)
    } else {
        array
    };

    let shape = array.shape().to_vec();
    array.into_dimensionality::<Ix2>().map_err(|_| {
        VoxprofileError::Model(format!("expected a 2-D {what} output, got shape {shape:?}"))
    })
}

fn to_2d(array: ArrayD<f32>, what: &str) -> Result<Array2<f32>> {
    let shape = array.shape().to_vec();
    array.into_dimensionality::<Ix2>().map_err(|_| {
        VoxprofileError::Model(format!("expected a 2-D {what} output, got shape {shape:?}"))
    })
}

impl Encoder for InferenceContext {
    fn encode(&mut self, batch: &Batch) -> Result<Array2<f32>> {
        let names = [self.embedding_output.clone()];
        let mut outputs = self.run(batch, &names)?;
        let output = outputs.pop().ok_or_else(|| {
            VoxprofileError::Model("encoder produced no output".to_string())
        })?;
        squeeze_to_2d(output, "embedding")
    }
}

impl Classifier for InferenceContext {
    fn classify(&mut self, batch: &Batch, encoder_contrastive: bool) -> Result<NetOutput> {
        if !encoder_contrastive {
            let names = [self.logits_output.clone()];
            let mut outputs = self.run(batch, &names)?;
            let logits = outputs.pop().ok_or_else(|| {
                VoxprofileError::Model("classifier produced no output".to_string())
            })?;
            return Ok(NetOutput::Logits(to_2d(logits, "logits")?));
        }

        let names = self.contrastive_outputs.clone();
        let mut outputs = self.run(batch, &names)?.into_iter();
        let mut next = || {
            outputs.next().ok_or_else(|| {
                VoxprofileError::Model("classifier produced too few outputs".to_string())
            })
        };

        let ae_input = next()?;
        let ae_hidden = to_2d(next()?, "autoencoder hidden")?;
        let cnn_hidden = to_2d(next()?, "hidden")?;
        let ae_output = next()?;
        let logits = to_2d(next()?, "logits")?;

        Ok(NetOutput::EncoderContrastive {
            ae_input,
            ae_hidden,
            cnn_hidden,
            ae_output,
            logits,
        })
    }
}
