use std::io;

#[derive(Debug, thiserror::Error)]
pub enum VoxprofileError {
    #[error("config error: {0}")]
    Config(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("profile error: {0}")]
    Profile(String),

    #[error("criterion error: {0}")]
    Criterion(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("feature file error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, VoxprofileError>;
