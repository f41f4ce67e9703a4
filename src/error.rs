use std::path::PathBuf;
use thiserror::Error;

/// Result type for the training core.
pub type Result<T> = std::result::Result<T, StackGanError>;

/// Errors raised while building models, training, or handling checkpoints.
#[derive(Debug, Error)]
pub enum StackGanError {
    /// A model or trainer was configured with values it cannot honour.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A requested mode of operation is not available.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Tensors that must agree in shape do not.
    #[error("shape mismatch between {what}: {shapes}")]
    ShapeMismatch { what: &'static str, shapes: String },

    /// No `model_<epoch>` directory exists where one was expected.
    #[error("no candidate models found in '{}'", .0.display())]
    NoCheckpoints(PathBuf),

    /// A specific checkpoint file or directory is absent.
    #[error("missing checkpoint '{}'", .0.display())]
    MissingCheckpoint(PathBuf),

    /// The recorder failed to write or read a parameter snapshot.
    #[error("recorder failed for '{}': {message}", .path.display())]
    Recorder { path: PathBuf, message: String },

    /// A data loader produced no batch for a whole pass.
    #[error("the {0} data loader yielded no batches")]
    EmptyEpoch(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StackGanError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

/// Fail with [`StackGanError::ShapeMismatch`] unless every shape is equal.
pub fn ensure_same_shape<const D: usize>(what: &'static str, shapes: &[[usize; D]]) -> Result<()> {
    match shapes.split_first() {
        Some((first, rest)) if rest.iter().any(|shape| shape != first) => {
            let shapes = shapes
                .iter()
                .map(|shape| format!("{shape:?}"))
                .collect::<Vec<_>>()
                .join(" vs ");
            Err(StackGanError::ShapeMismatch { what, shapes })
        }
        _ => Ok(()),
    }
}
