//! Face embedding for photo clustering.
//!
//! # Pipeline
//!
//! 1. [`FaceDetector::detect`]: decoded photo -> face boxes with confidence
//! 2. crop with margin, [`quality::assess`] -> [`QualityScores`]
//! 3. [`FaceEmbedder::embed`]: face crop -> vector, normalized to unit length
//!
//! When no embedding model is available (or it fails on a face),
//! [`FallbackEmbedder`] produces a deterministic, model-free vector with the
//! same contract, so clustering keeps working at reduced accuracy.

mod detector;
mod error;
pub mod fallback;
mod generator;
mod model;
pub mod quality;
mod types;

pub use detector::WholeImageDetector;
pub use error::FaceprintError;
pub use fallback::FallbackEmbedder;
pub use generator::{EmbeddingGenerator, GeneratorConfig, decode_image};
pub use model::{FaceDetector, FaceEmbedder};
pub use types::{BoundingBox, DetectedFace, FaceEmbedding, PoseAngles, PoseCategory, QualityScores};

pub use image::DynamicImage;
