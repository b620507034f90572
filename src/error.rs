use thiserror::Error;

use crate::model::ModelKind;

/// Failures that can occur between receiving image bytes and producing a
/// diagnosis. Everything here is caught at the request-handler boundary and
/// turned into a structured HTTP response.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to load {kind} model: {reason}")]
    ModelLoad { kind: ModelKind, reason: String },

    /// A previous load attempt for this model already failed; requests fail
    /// fast instead of retrying the load.
    #[error("{kind} model unavailable: {reason}")]
    ModelUnavailable { kind: ModelKind, reason: String },

    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    /// The CAM engine did not observe the activation or gradient it needs.
    #[error("activation capture failed: {0}")]
    Capture(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("image processing failed: {0}")]
    Image(String),

    /// A model produced a class id outside the fixed label table. This is a
    /// defect in the model artifact, not a valid "unknown" outcome.
    #[error("class id {0} is outside the label table")]
    UnknownClass(usize),
}

impl From<ort::Error> for PipelineError {
    fn from(err: ort::Error) -> Self {
        Self::Inference(err.to_string())
    }
}

impl From<candle_core::Error> for PipelineError {
    fn from(err: candle_core::Error) -> Self {
        Self::Inference(err.to_string())
    }
}
