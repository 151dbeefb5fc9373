use crate::annotation::Encoding;
use crate::storage::Format;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("scale level {0} not found in multiscale metadata")]
    LevelNotFound(String),
    #[error("unknown coordinate transformation type in attributes for {level}: {kind}")]
    UnknownTransform { level: String, kind: String },
    #[error("did not find translation and scale value in attributes for {0}")]
    IncompleteTransform(String),
    #[error("no scale level with scale {0:?}")]
    ScaleNotFound(Vec<f64>),
    #[error("smoothing relies on a large value for unknown, got {encoding:?} (margin {margin})")]
    UnsafeEncoding { encoding: Encoding, margin: f64 },
    #[error("smooth multiscaling not implemented for annotations of type {0}")]
    NotImplemented(String),
    #[error("could not find multiscale metadata in any group ancestral to the array at {0}")]
    MetadataNotFound(String),
    #[error("missing attribute {0}")]
    MissingAttribute(String),
    #[error("{path}: stored as {format}")]
    ForeignFormat { path: PathBuf, format: Format },
    #[error("{0} support was not compiled in")]
    BackendUnavailable(Format),
    #[error("could not select {0}")]
    Selection(String),
    #[error("{0} does not exist")]
    NotFound(PathBuf),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Errors that mean "the thing asked for is not there", as opposed to broken data or I/O.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            Error::LevelNotFound(_) | Error::ScaleNotFound(_) | Error::MetadataNotFound(_) | Error::MissingAttribute(_)
        )
    }
}

pub(crate) fn storage_err(e: impl std::fmt::Display) -> Error { Error::Storage(e.to_string()) }

pub type Result<T> = std::result::Result<T, Error>;
