use thiserror::Error;

/// Errors returned by face detection and embedding.
#[derive(Debug, Error)]
pub enum FaceprintError {
    #[error("faceprint: decode image: {0}")]
    Decode(String),

    #[error("faceprint: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("faceprint: detector: {0}")]
    Detector(String),

    #[error("faceprint: model: {0}")]
    Model(String),

    #[error("faceprint: empty crop")]
    EmptyCrop,
}
