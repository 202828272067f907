use std::path::{Path, PathBuf};

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml failure: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("electrode geometry has {found} coordinates but n_channels is {expected}")]
    Geometry { expected: usize, found: usize },

    #[error("`{}` is {len} bytes, not a multiple of the {frame_bytes}-byte frame", path.display())]
    CorruptArtifact {
        path: PathBuf,
        len: u64,
        frame_bytes: u64,
    },

    #[error("`{}` has {found} bytes, expected {expected}", path.display())]
    ArtifactSizeMismatch {
        path: PathBuf,
        expected: u64,
        found: u64,
    },

    #[error("cannot decode `{}`: {reason}", path.display())]
    UnreadableArtifact { path: PathBuf, reason: String },

    #[error("missing expected artifact at `{}`", .0.display())]
    MissingArtifact(PathBuf),

    #[error("worker pool failure: {0}")]
    WorkerPool(String),
}

impl PipelineError {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The artifact a file-level fault points at, if the error names one.
    pub fn artifact_path(&self) -> Option<&Path> {
        match self {
            Self::CorruptArtifact { path, .. }
            | Self::ArtifactSizeMismatch { path, .. }
            | Self::UnreadableArtifact { path, .. } => Some(path),
            _ => None,
        }
    }
}
