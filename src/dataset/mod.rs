pub mod collate;
pub mod loader;

use std::fs::File;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use ndarray_npy::{ReadNpyError, ReadNpyExt};

use crate::config::{Config, ManifestConfig};
use crate::error::{Result, VoxprofileError};

/// One utterance: its identifier, precomputed spectral features
/// (`[bins, frames]`) and class label.
#[derive(Debug, Clone)]
pub struct FeatureRecord {
    pub id: String,
    pub features: Array2<f32>,
    pub label: usize,
}

impl FeatureRecord {
    #[must_use]
    pub fn num_bins(&self) -> usize {
        self.features.nrows()
    }

    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.features.ncols()
    }
}

/// Derive the companion feature file for a manifest entry.
///
/// `root` is prepended verbatim, then `offset` trailing characters (usually an
/// audio extension such as `.wav`) are dropped and `suffix` is appended.
pub fn feature_path(root: &str, file: &str, offset: usize, suffix: &str) -> Result<PathBuf> {
    let full = format!("{root}{file}");
    let stem = if offset == 0 {
        full.as_str()
    } else {
        let chars = full.chars().count();
        if offset > chars {
            return Err(VoxprofileError::Dataset(format!(
                "cannot strip {offset} characters from '{full}'"
            )));
        }
        let cut = full
            .char_indices()
            .nth(chars - offset)
            .map_or(full.len(), |(i, _)| i);
        &full[..cut]
    };
    Ok(PathBuf::from(format!("{stem}{suffix}")))
}

/// Load a 2-D feature array stored as either `f32` or `f64`.
pub fn load_features(path: &Path) -> Result<Array2<f32>> {
    let file = File::open(path).map_err(|e| {
        VoxprofileError::Dataset(format!("failed to open feature file {}: {e}", path.display()))
    })?;

    match Array2::<f32>::read_npy(file) {
        Ok(features) => Ok(features),
        Err(ReadNpyError::WrongDescriptor(_)) => {
            let file = File::open(path)?;
            let features = Array2::<f64>::read_npy(file)?;
            Ok(features.mapv(|v| v as f32))
        }
        Err(e) => Err(e.into()),
    }
}

fn column_index(headers: &csv::StringRecord, name: &str, manifest: &Path) -> Result<usize> {
    headers.iter().position(|h| h == name).ok_or_else(|| {
        VoxprofileError::Dataset(format!(
            "column '{name}' not found in {}",
            manifest.display()
        ))
    })
}

/// Read every row of a CSV manifest and eagerly load its feature file.
pub fn load_manifest(manifest: &ManifestConfig, feature_suffix: &str) -> Result<Vec<FeatureRecord>> {
    let csv_path = Config::expand_path(&manifest.csv);
    let mut reader = csv::Reader::from_path(&csv_path)?;
    let headers = reader.headers()?.clone();

    let file_col = column_index(&headers, &manifest.file_column, &csv_path)?;
    let label_col = column_index(&headers, &manifest.label_column, &csv_path)?;
    let id_col = column_index(&headers, &manifest.id_column, &csv_path)?;

    let mut records = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let record = result?;
        let field = |col: usize| record.get(col).unwrap_or_default();

        let label_text = field(label_col).trim();
        let label = label_text.parse::<usize>().map_err(|e| {
            VoxprofileError::Dataset(format!(
                "{} row {}: invalid label '{label_text}': {e}",
                csv_path.display(),
                row + 1,
            ))
        })?;

        let path = feature_path(&manifest.root, field(file_col), manifest.offset, feature_suffix)?;
        let features = load_features(&path)?;

        records.push(FeatureRecord {
            id: field(id_col).to_string(),
            features,
            label,
        });
    }

    tracing::info!("loaded {} records from {}", records.len(), csv_path.display());
    Ok(records)
}

/// Records from one or more manifests, kept in manifest order.
#[derive(Debug, Default)]
pub struct FeatureDataset {
    records: Vec<FeatureRecord>,
}

impl FeatureDataset {
    pub fn from_manifests(manifests: &[ManifestConfig], feature_suffix: &str) -> Result<Self> {
        if manifests.is_empty() {
            return Err(VoxprofileError::Config(
                "no manifests configured".to_string(),
            ));
        }

        let mut records = Vec::new();
        for manifest in manifests {
            records.extend(load_manifest(manifest, feature_suffix)?);
        }
        Ok(Self { records })
    }

    #[must_use]
    pub fn from_records(records: Vec<FeatureRecord>) -> Self {
        Self { records }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[FeatureRecord] {
        &self.records
    }
}
