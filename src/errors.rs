use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::session::SessionState;
use crate::weights::ModelVariant;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Why a weight file could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFailureReason {
    Network,
    Io,
}

impl fmt::Display for WeightFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("network_error"),
            Self::Io => f.write_str("io_error"),
        }
    }
}

/// Structured error types for interactive segmentation.
///
/// Each variant carries the context of its own domain (ingestion, backend,
/// weights, session usage) so callers can react without parsing messages.
/// Usage errors are soft: the session is left untouched and the caller may
/// simply continue, see [`SegError::is_usage_error`].
#[derive(Error, Debug)]
pub enum SegError {
    #[error("Unsupported image shape {shape:?}: expected (H, W), (H, W, 3) or (H, W, 4)")]
    InvalidImageShape { shape: Vec<usize> },

    #[error("No segmentation model attached: {operation} ignored")]
    ModelNotLoaded { operation: String },

    #[error("No image loaded: {operation} ignored")]
    NoImage { operation: String },

    #[error("Prediction failed: {operation}")]
    Prediction {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Could not resolve weights for {variant} ({reason})")]
    WeightResolution {
        variant: ModelVariant,
        reason: WeightFailureReason,
        #[source]
        source: BoxedSource,
    },

    #[error("{operation} is not allowed while the session is {state:?}")]
    InvalidState {
        operation: String,
        state: SessionState,
    },

    #[error("A prediction is already in flight (generation {generation})")]
    PredictionInFlight { generation: u64 },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SegError>;

impl SegError {
    /// Errors raised by calling an operation at the wrong time.
    ///
    /// The session state is unchanged when one of these is returned, so an
    /// event loop can log it and keep going.
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::PredictionInFlight { .. }
                | Self::ModelNotLoaded { .. }
                | Self::NoImage { .. }
        )
    }

    /// Wrap a backend failure. Errors that are already prediction failures
    /// pass through unchanged.
    pub fn prediction(operation: impl Into<String>, err: SegError) -> Self {
        match err {
            err @ Self::Prediction { .. } => err,
            err => Self::Prediction {
                operation: operation.into(),
                source: Box::new(err),
            },
        }
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Used at the CLI boundary where script and argument problems surface as
/// `anyhow::Error`.
impl From<anyhow::Error> for SegError {
    fn from(err: anyhow::Error) -> Self {
        SegError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build `SegError::FileSystem`
/// itself; this is the fallback.
impl From<std::io::Error> for SegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for SegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for SegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor plumbing around inference, so they are
/// model errors rather than a category of their own.
impl From<ndarray::ShapeError> for SegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for SegError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation {
            field: "script".to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_are_soft() {
        let idle = SegError::InvalidState {
            operation: "confirm".to_string(),
            state: SessionState::Idle,
        };
        assert!(idle.is_usage_error());
        assert!(SegError::PredictionInFlight { generation: 3 }.is_usage_error());
        assert!(SegError::ModelNotLoaded {
            operation: "predict".to_string()
        }
        .is_usage_error());

        let shape = SegError::InvalidImageShape { shape: vec![2, 2, 2] };
        assert!(!shape.is_usage_error());
    }

    #[test]
    fn weight_failure_reason_display() {
        assert_eq!(WeightFailureReason::Network.to_string(), "network_error");
        assert_eq!(WeightFailureReason::Io.to_string(), "io_error");
    }
}
