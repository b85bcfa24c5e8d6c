use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::dataset::FeatureDataset;
use crate::dataset::loader::DataLoader;
use crate::error::Result;
use crate::model::{Encoder, InferenceContext};

use super::{ProfileAccumulator, ProfileSet, mean_over_time, profile_path};

/// Profiles are built one utterance at a time; the identifier grouping does
/// not support larger batches.
pub const PROFILE_BATCH_SIZE: usize = 1;

/// Embed every record of `dataset` and average the embeddings per identifier.
pub fn generate_profiles(encoder: &mut dyn Encoder, dataset: &FeatureDataset) -> Result<ProfileSet> {
    let loader = DataLoader::new(dataset, PROFILE_BATCH_SIZE);
    let total = loader.num_batches();
    let mut accumulator = ProfileAccumulator::new();

    for (step, batch) in loader.enumerate() {
        let batch = batch?;
        let output = encoder.encode(&batch)?;
        let embedding = mean_over_time(&output)?;
        accumulator.push_batch(&batch, embedding)?;

        if (step + 1) % 100 == 0 {
            tracing::debug!("embedded {}/{total} utterances", step + 1);
        }
    }

    accumulator.finalize()
}

/// Load the checkpoint and manifests, build the profiles and write them next
/// to the checkpoint. Returns the written path.
pub fn run_generation(config: &Config, checkpoint: &Path) -> Result<PathBuf> {
    tracing::info!("loading model from {}", checkpoint.display());
    let mut context = InferenceContext::new(checkpoint, &config.model)?;

    let dataset = FeatureDataset::from_manifests(&config.manifests, &config.dataset.feature_suffix)?;
    tracing::info!(
        "embedding {} utterances on {}",
        dataset.len(),
        if context.gpu() { "gpu" } else { "cpu" }
    );

    let profiles = generate_profiles(&mut context, &dataset)?;

    let path = profile_path(checkpoint);
    tracing::info!("saving {} profiles to {}", profiles.len(), path.display());
    profiles.save(&path)?;

    Ok(path)
}
