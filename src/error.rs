use serde::Serialize;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

use crate::model::ModelError;

/// Failure to acquire or validate the room image.
///
/// Always reported before any model work happens.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no image source was provided")]
    NoInputProvided,

    #[error("exactly one image source must be provided, got {0}")]
    AmbiguousInput(usize),

    #[error("network error or invalid URL: {0}")]
    NetworkError(String),

    #[error("URL does not point to an image (content type: {content_type})")]
    NotAnImage { content_type: String },

    #[error("image file not found at path: {}", .0.display())]
    NotFound(PathBuf),

    #[error("could not read {}: {source}", .path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid base64 payload: {0}")]
    InvalidEncoding(String),

    #[error("image exceeds decoder safety limits: {0}")]
    UnsafeImage(String),

    #[error(
        "image resolution ({width}x{height}) is below minimum of {min_width}x{min_height}"
    )]
    TooSmall {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },

    #[error("image is corrupt, unreadable, or invalid: {0}")]
    Corrupt(String),
}

impl ValidationError {
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::NoInputProvided => "no_input_provided",
            ValidationError::AmbiguousInput(_) => "ambiguous_input",
            ValidationError::NetworkError(_) => "network_error",
            ValidationError::NotAnImage { .. } => "not_an_image",
            ValidationError::NotFound(_) => "not_found",
            ValidationError::ReadError { .. } => "read_error",
            ValidationError::InvalidEncoding(_) => "invalid_encoding",
            ValidationError::UnsafeImage(_) => "unsafe_image",
            ValidationError::TooSmall { .. } => "too_small",
            ValidationError::Corrupt(_) => "corrupt",
        }
    }
}

/// Fatal failure while bringing up the model. Never retried per request.
#[derive(Clone, Debug, Error)]
pub enum LoadError {
    #[error("model files for '{model_id}' could not be located: {message}")]
    NotFound { model_id: String, message: String },

    #[error("failed to inspect model parameters: {0}")]
    Inspect(String),

    #[error(
        "model needs {required} bytes but only {available} bytes of host memory are budgeted"
    )]
    InsufficientMemory { required: u64, available: u64 },

    #[error("failed to materialize model weights: {0}")]
    Materialize(String),

    #[error("failed to load processor: {0}")]
    Processor(String),
}

/// Fatal failure to locate or parse the design configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at '{}'", .0.display())]
    NotFound(PathBuf),

    #[error("could not read configuration '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of a single generation call. No partial output is ever returned
/// alongside it.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to encode prompt: {0}")]
    Encode(#[source] ModelError),

    #[error("generation failed: {0}")]
    Generate(#[source] ModelError),

    #[error("failed to decode output: {0}")]
    Decode(#[source] ModelError),

    #[error("generation did not finish within {0:?}")]
    Timeout(Duration),

    #[error("inference worker is not running")]
    WorkerUnavailable,

    #[error("inference backend panicked: {0}")]
    Panicked(String),
}

/// Outcome of a failed design request.
#[derive(Debug, Error)]
pub enum DesignError {
    #[error("image validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to analyze the room image: {detail}")]
    AnalysisFailed { detail: String },

    #[error("failed to generate a final placement suggestion: {detail}")]
    PlacementFailed { detail: String },

    #[error("unexpected failure: {0}")]
    Internal(String),
}

impl DesignError {
    pub fn reason(&self) -> &'static str {
        match self {
            DesignError::Validation(e) => e.reason(),
            DesignError::AnalysisFailed { .. } => "analysis_failed",
            DesignError::PlacementFailed { .. } => "placement_failed",
            DesignError::Internal(_) => "internal",
        }
    }

    /// Whether the caller supplied something unusable, as opposed to a
    /// failure on our side.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, DesignError::Validation(_))
    }

    pub fn payload(&self) -> FailurePayload {
        FailurePayload {
            error: self.reason(),
            detail: self.to_string(),
        }
    }
}

/// Failure as handed to hosting layers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailurePayload {
    pub error: &'static str,
    pub detail: String,
}
