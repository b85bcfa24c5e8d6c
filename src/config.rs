use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, VoxprofileError};

const fn default_true() -> bool {
    true
}

fn default_features_input() -> String {
    "features".to_string()
}

fn default_mask_input() -> String {
    "lengths".to_string()
}

fn default_embedding_output() -> String {
    "x".to_string()
}

fn default_logits_output() -> String {
    "logits".to_string()
}

fn default_contrastive_outputs() -> Vec<String> {
    ["ae_input", "ae_hidden", "cnn_hidden", "ae_output", "logits"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_file_column() -> String {
    "file_path".to_string()
}

fn default_label_column() -> String {
    "label".to_string()
}

fn default_id_column() -> String {
    "id".to_string()
}

const fn default_offset() -> usize {
    4
}

fn default_feature_suffix() -> String {
    "_mel_2048_128.npy".to_string()
}

fn default_criterion_name() -> String {
    "cross_entropy".to_string()
}

fn default_class_weights() -> Vec<f32> {
    vec![1.0, 7.0]
}

const fn default_contrastive_weight() -> f32 {
    0.0005
}

const fn default_temperature() -> f32 {
    0.07
}

const fn default_batch_size() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub manifests: Vec<ManifestConfig>,

    #[serde(default)]
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub optimization: OptimizationConfig,

    #[serde(default)]
    pub criterion: CriterionConfig,

    #[serde(default)]
    pub validate: ValidateConfig,
}

/// ONNX checkpoint location and tensor names.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub checkpoint: Option<String>,

    #[serde(default = "default_true")]
    pub gpu: bool,

    #[serde(default = "default_features_input")]
    pub features_input: String,

    #[serde(default = "default_mask_input")]
    pub mask_input: String,

    #[serde(default = "default_embedding_output")]
    pub embedding_output: String,

    #[serde(default = "default_logits_output")]
    pub logits_output: String,

    /// Output names read in encoder-contrastive mode, in tuple order.
    #[serde(default = "default_contrastive_outputs")]
    pub contrastive_outputs: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            gpu: true,
            features_input: default_features_input(),
            mask_input: default_mask_input(),
            embedding_output: default_embedding_output(),
            logits_output: default_logits_output(),
            contrastive_outputs: default_contrastive_outputs(),
        }
    }
}

/// One CSV manifest and the columns to read from it.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestConfig {
    pub csv: String,

    /// Prefix prepended verbatim to every value of the file column.
    #[serde(default)]
    pub root: String,

    #[serde(default = "default_file_column")]
    pub file_column: String,

    #[serde(default = "default_label_column")]
    pub label_column: String,

    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Number of trailing characters stripped from the file column before the
    /// feature suffix is appended. Zero keeps the value as is.
    #[serde(default = "default_offset")]
    pub offset: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_feature_suffix")]
    pub feature_suffix: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            feature_suffix: default_feature_suffix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OptimizationConfig {
    #[serde(default)]
    pub sentence_avg: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CriterionConfig {
    #[serde(default = "default_criterion_name")]
    pub name: String,

    /// Falls back to `optimization.sentence_avg` when unset.
    pub sentence_avg: Option<bool>,

    #[serde(default = "default_class_weights")]
    pub class_weights: Vec<f32>,

    #[serde(default)]
    pub encoder_contrastive: bool,

    #[serde(default = "default_contrastive_weight")]
    pub contrastive_weight: f32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_temperature")]
    pub base_temperature: f32,
}

impl Default for CriterionConfig {
    fn default() -> Self {
        Self {
            name: default_criterion_name(),
            sentence_avg: None,
            class_weights: default_class_weights(),
            encoder_contrastive: false,
            contrastive_weight: default_contrastive_weight(),
            temperature: default_temperature(),
            base_temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(VoxprofileError::Config(format!(
                "config file not found: {} — create it or use --config to specify a path",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            VoxprofileError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            VoxprofileError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        if config.validate.batch_size == 0 {
            return Err(VoxprofileError::Config(format!(
                "validate.batch_size must be at least 1 in {}",
                path.display()
            )));
        }

        Ok(config)
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("voxprofile/config.yaml")
    }

    /// Expand `~` in a path string to the user's home directory.
    #[must_use]
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        PathBuf::from(path)
    }

    /// The checkpoint to load, preferring an explicit override.
    pub fn checkpoint_path(&self, override_path: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = override_path {
            return Ok(path.to_path_buf());
        }
        self.model
            .checkpoint
            .as_deref()
            .map(Self::expand_path)
            .ok_or_else(|| {
                VoxprofileError::Config(
                    "no checkpoint configured — set model.checkpoint or pass --checkpoint"
                        .to_string(),
                )
            })
    }

    /// Whether the criterion normalizes by sentences, inheriting the
    /// optimization setting unless the criterion overrides it.
    #[must_use]
    pub fn sentence_avg(&self) -> bool {
        self.criterion
            .sentence_avg
            .unwrap_or(self.optimization.sentence_avg)
    }
}
