use image::DynamicImage;

use crate::error::FaceprintError;
use crate::model::FaceDetector;
use crate::types::{BoundingBox, DetectedFace};

/// Treats every image as a single pre-cropped face.
///
/// Used when the catalog already holds face crops, and by the CLI when no
/// detector model is configured.
#[derive(Debug, Default, Clone)]
pub struct WholeImageDetector;

impl FaceDetector for WholeImageDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>, FaceprintError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![DetectedFace {
            bbox: BoundingBox::full(),
            confidence: 1.0,
            pose: None,
            eyes: None,
        }])
    }
}
