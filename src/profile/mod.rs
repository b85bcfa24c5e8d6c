pub mod generate;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Axis};

use crate::dataset::collate::Batch;
use crate::error::{Result, VoxprofileError};

/// File written next to the checkpoint.
pub const PROFILE_FILE_NAME: &str = "profile.pt";

const MAGIC: &[u8; 4] = b"VXPF";
const FORMAT_VERSION: u32 = 1;

/// Averaged embedding for one identifier.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Profile {
    pub observations: u32,
    pub embedding: Vec<f32>,
}

/// Finalized identifier → profile mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSet {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileSet {
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Profile)> {
        self.profiles.iter()
    }

    /// Total number of observations across all identifiers.
    #[must_use]
    pub fn observations(&self) -> u64 {
        self.profiles.values().map(|p| u64::from(p.observations)).sum()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        deserialize(&data)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serialize(self)?)?;
        Ok(())
    }
}

/// Collects per-utterance embeddings grouped by identifier.
#[derive(Debug, Default)]
pub struct ProfileAccumulator {
    embeddings: BTreeMap<String, Vec<Vec<f32>>>,
}

impl ProfileAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: &str, embedding: Vec<f32>) {
        self.embeddings.entry(id.to_string()).or_default().push(embedding);
    }

    /// Record the embedding of a single-example batch.
    ///
    /// Grouping by identifier only holds for batches of exactly one example,
    /// so anything larger is rejected.
    pub fn push_batch(&mut self, batch: &Batch, embedding: Vec<f32>) -> Result<()> {
        match batch.ids.as_slice() {
            [id] => {
                self.push(id, embedding);
                Ok(())
            }
            ids => Err(VoxprofileError::Profile(format!(
                "profile generation needs batches of one example, got {}",
                ids.len()
            ))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Replace every identifier's embeddings with their elementwise mean.
    pub fn finalize(self) -> Result<ProfileSet> {
        let mut profiles = BTreeMap::new();
        let mut total = 0usize;

        for (id, embeddings) in self.embeddings {
            tracing::info!("{id}: {} observations", embeddings.len());
            total += embeddings.len();

            let embedding = mean_embedding(&id, &embeddings)?;
            let observations = u32::try_from(embeddings.len()).map_err(|_| {
                VoxprofileError::Profile(format!("too many observations for '{id}'"))
            })?;
            profiles.insert(id, Profile { observations, embedding });
        }

        tracing::info!("{total} observations across {} identifiers", profiles.len());
        Ok(ProfileSet { profiles })
    }
}

fn mean_embedding(id: &str, embeddings: &[Vec<f32>]) -> Result<Vec<f32>> {
    let Some(first) = embeddings.first() else {
        return Err(VoxprofileError::Profile(format!("no embeddings for '{id}'")));
    };

    let dim = first.len();
    let mut sum = vec![0.0f64; dim];
    for emb in embeddings {
        if emb.len() != dim {
            return Err(VoxprofileError::Profile(format!(
                "embedding dimension mismatch for '{id}': {} vs {dim}",
                emb.len()
            )));
        }
        for (acc, &v) in sum.iter_mut().zip(emb) {
            *acc += f64::from(v);
        }
    }

    let n = embeddings.len() as f64;
    Ok(sum.into_iter().map(|v| (v / n) as f32).collect())
}

/// Collapse an encoder output `[frames, dim]` to one vector by averaging over
/// time.
pub fn mean_over_time(output: &Array2<f32>) -> Result<Vec<f32>> {
    output
        .mean_axis(Axis(0))
        .map(|mean| mean.to_vec())
        .ok_or_else(|| VoxprofileError::Profile("encoder returned no frames".to_string()))
}

/// `<checkpoint-directory>/profile.pt`.
#[must_use]
pub fn profile_path(checkpoint: &Path) -> PathBuf {
    checkpoint
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from(PROFILE_FILE_NAME), |dir| dir.join(PROFILE_FILE_NAME))
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| VoxprofileError::Profile(format!("{what} too large: {len}")))
}

fn serialize(set: &ProfileSet) -> Result<Vec<u8>> {
    // magic + version(u32) + count(u32), then per entry:
    // id_len(u32) + id_bytes + observations(u32) + dim(u32) + dim f32s
    let mut data = Vec::new();
    data.extend_from_slice(MAGIC);
    data.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    data.extend_from_slice(&len_u32(set.len(), "profile count")?.to_le_bytes());

    for (id, profile) in &set.profiles {
        let id_bytes = id.as_bytes();
        data.extend_from_slice(&len_u32(id_bytes.len(), "identifier")?.to_le_bytes());
        data.extend_from_slice(id_bytes);
        data.extend_from_slice(&profile.observations.to_le_bytes());
        data.extend_from_slice(&len_u32(profile.embedding.len(), "embedding")?.to_le_bytes());
        for &v in &profile.embedding {
            data.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(data)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| VoxprofileError::Profile("profile data truncated".to_string()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| {
            VoxprofileError::Profile("invalid profile data".to_string())
        })?))
    }

    fn f32(&mut self) -> Result<f32> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes(bytes.try_into().map_err(|_| {
            VoxprofileError::Profile("invalid float data".to_string())
        })?))
    }
}

fn deserialize(data: &[u8]) -> Result<ProfileSet> {
    let mut reader = Reader { data, pos: 0 };

    if reader.take(4)? != MAGIC {
        return Err(VoxprofileError::Profile("not a profile file".to_string()));
    }
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(VoxprofileError::Profile(format!(
            "unsupported profile format version {version}"
        )));
    }

    let count = reader.u32()?;
    let mut profiles = BTreeMap::new();
    for _ in 0..count {
        let id_len = reader.u32()? as usize;
        let id = String::from_utf8(reader.take(id_len)?.to_vec())
            .map_err(|e| VoxprofileError::Profile(format!("invalid identifier: {e}")))?;
        let observations = reader.u32()?;
        let dim = reader.u32()? as usize;
        let embedding = (0..dim).map(|_| reader.f32()).collect::<Result<Vec<_>>>()?;
        profiles.insert(id, Profile { observations, embedding });
    }

    if reader.pos != data.len() {
        return Err(VoxprofileError::Profile(format!(
            "{} trailing bytes after profile data",
            data.len() - reader.pos
        )));
    }

    Ok(ProfileSet { profiles })
}
