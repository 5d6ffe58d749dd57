use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use facegroup_vecstore::l2_normalize;

use crate::error::FaceprintError;
use crate::fallback::{DEFAULT_SEED, FallbackEmbedder};
use crate::model::{FaceDetector, FaceEmbedder};
use crate::quality;
use crate::types::FaceEmbedding;

/// GeneratorConfig configures an [`EmbeddingGenerator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Detections below this confidence are skipped. Default: 0.5.
    pub min_confidence: f32,
    /// Faces whose shorter side is below this many pixels are skipped. Default: 40.
    pub min_face_px: u32,
    /// Crop margin as a fraction of the box size on each side. Default: 0.2.
    pub crop_margin: f32,
    /// Eye-visibility score when the detector provides none. Default: 0.5.
    pub default_eyes: f32,
    /// Seed of the fallback projection.
    pub fallback_seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            min_face_px: 40,
            crop_margin: 0.2,
            default_eyes: 0.5,
            fallback_seed: DEFAULT_SEED,
        }
    }
}

/// Decode an encoded image (JPEG, PNG, WebP).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, FaceprintError> {
    image::load_from_memory(bytes).map_err(|e| FaceprintError::Decode(e.to_string()))
}

/// EmbeddingGenerator turns a photo into unit-length face embeddings.
///
/// Pipeline per detection: confidence/size filter, crop with margin,
/// quality scoring, model embedding (or the deterministic fallback when no
/// model is configured or the model fails), normalization.
pub struct EmbeddingGenerator {
    detector: Arc<dyn FaceDetector>,
    model: Option<Arc<dyn FaceEmbedder>>,
    fallback: FallbackEmbedder,
    cfg: GeneratorConfig,
    dim: usize,
}

impl EmbeddingGenerator {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        model: Option<Arc<dyn FaceEmbedder>>,
        dim: usize,
        cfg: GeneratorConfig,
    ) -> Result<Self, FaceprintError> {
        if let Some(m) = &model {
            if m.dimension() != dim {
                return Err(FaceprintError::DimensionMismatch {
                    expected: dim,
                    got: m.dimension(),
                });
            }
        }
        Ok(Self {
            detector,
            model,
            fallback: FallbackEmbedder::new(dim, cfg.fallback_seed),
            cfg,
            dim,
        })
    }

    /// Fallback-only generator.
    pub fn fallback_only(detector: Arc<dyn FaceDetector>, dim: usize, cfg: GeneratorConfig) -> Self {
        Self {
            detector,
            model: None,
            fallback: FallbackEmbedder::new(dim, cfg.fallback_seed),
            cfg,
            dim,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Detects and embeds every usable face in `image`, in detector order.
    pub fn process(&self, image: &DynamicImage) -> Result<Vec<FaceEmbedding>, FaceprintError> {
        let (iw, ih) = (image.width(), image.height());
        let detections = self.detector.detect(image)?;
        let mut out = Vec::with_capacity(detections.len());

        for det in detections {
            if det.confidence < self.cfg.min_confidence {
                continue;
            }
            let (_, _, bw, bh) = det.bbox.to_pixels(iw, ih, 0.0);
            if bw.min(bh) < self.cfg.min_face_px {
                debug!(width = bw, height = bh, "faceprint: face too small, skipped");
                continue;
            }
            let (cx, cy, cw, ch) = det.bbox.to_pixels(iw, ih, self.cfg.crop_margin);
            if cw == 0 || ch == 0 {
                continue;
            }
            let crop = image.crop_imm(cx, cy, cw, ch);
            let gray = crop.to_luma8();

            let pose = det.pose.unwrap_or_default();
            let mut q = quality::assess(&gray, &pose, det.eyes.unwrap_or(self.cfg.default_eyes));
            // Size reflects the face itself, not the margin.
            q.size = quality::size_score(bw, bh);

            let (vector, fallback) = match self.embed_model(&crop) {
                Some(v) => (v, false),
                None => match self.fallback.embed_gray(&gray) {
                    Ok(v) => (v, true),
                    Err(e) => {
                        warn!(error = %e, "faceprint: fallback embedding failed, face skipped");
                        continue;
                    }
                },
            };

            out.push(FaceEmbedding {
                bbox: det.bbox,
                confidence: det.confidence,
                pose,
                quality: q,
                vector,
                fallback,
            });
        }
        Ok(out)
    }

    /// Model embedding, normalized; None when absent or unusable.
    fn embed_model(&self, crop: &DynamicImage) -> Option<Vec<f32>> {
        let model = self.model.as_ref()?;
        match model.embed(crop) {
            Ok(mut v) if v.len() == self.dim => {
                if l2_normalize(&mut v) {
                    Some(v)
                } else {
                    warn!("faceprint: model returned a zero vector, using fallback");
                    None
                }
            }
            Ok(v) => {
                warn!(got = v.len(), want = self.dim, "faceprint: model dimension mismatch, using fallback");
                None
            }
            Err(e) => {
                warn!(error = %e, "faceprint: model failed, using fallback");
                None
            }
        }
    }
}
