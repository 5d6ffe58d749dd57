use image::DynamicImage;

use crate::error::FaceprintError;
use crate::types::DetectedFace;

/// Finds faces in a decoded photo.
///
/// Implementations must be safe for concurrent use; the scan runs several
/// detections in parallel.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, FaceprintError>;
}

/// Maps a cropped face to a fixed-length embedding.
///
/// The output need not be normalized; the generator normalizes it.
/// Its length must equal [`FaceEmbedder::dimension`].
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, face: &DynamicImage) -> Result<Vec<f32>, FaceprintError>;

    fn dimension(&self) -> usize;
}
