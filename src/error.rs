use std::path::PathBuf;
use thiserror::Error;

use crate::oracle::OracleError;

/// Outcome of a detection cycle that did not produce groups.
///
/// The first two variants are expected domain conditions and map to 400s;
/// everything else is an unexpected fault.
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("HEIC images found but couldn't be converted. Please install ImageMagick.")]
    UnconvertibleImages,

    #[error("No valid images could be processed. Please check image formats.")]
    NoProcessableImages,

    #[error("workspace I/O failed for '{path}': {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("similarity oracle failed: {0:#}")]
    Oracle(anyhow::Error),

    #[error("detection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DetectError {
    pub fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace { path: path.into(), source }
    }

    /// True for conditions the caller caused (bad or unusable input).
    pub fn is_domain(&self) -> bool {
        matches!(self, Self::UnconvertibleImages | Self::NoProcessableImages)
    }
}

impl From<OracleError> for DetectError {
    fn from(e: OracleError) -> Self {
        match e {
            OracleError::EmptyInput => Self::NoProcessableImages,
            OracleError::Fault(inner) => Self::Oracle(inner),
        }
    }
}

pub type DetectResult<T> = std::result::Result<T, DetectError>;
