use serde::{Deserialize, Serialize};

/// Face rectangle in coordinates normalized to the source image,
/// each component in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn full() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Pixel rectangle `(x, y, w, h)` grown by `margin` (a fraction of the
    /// box size on each side) and clamped to the image.
    pub fn to_pixels(&self, img_w: u32, img_h: u32, margin: f32) -> (u32, u32, u32, u32) {
        let (iw, ih) = (img_w as f32, img_h as f32);
        let mx = self.width * margin;
        let my = self.height * margin;
        let x0 = ((self.x - mx) * iw).clamp(0.0, iw);
        let y0 = ((self.y - my) * ih).clamp(0.0, ih);
        let x1 = ((self.x + self.width + mx) * iw).clamp(0.0, iw);
        let y1 = ((self.y + self.height + my) * ih).clamp(0.0, ih);
        let (x0, y0) = (x0.floor() as u32, y0.floor() as u32);
        let (x1, y1) = (x1.ceil() as u32, y1.ceil() as u32);
        (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }
}

/// Head rotation in degrees. Negative yaw turns left, positive pitch looks up.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseAngles {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl PoseAngles {
    pub const FRONTAL_YAW: f32 = 20.0;
    pub const FRONTAL_PITCH: f32 = 15.0;

    pub fn category(&self) -> PoseCategory {
        let (ay, ap) = (self.yaw.abs(), self.pitch.abs());
        if ay <= Self::FRONTAL_YAW && ap <= Self::FRONTAL_PITCH {
            PoseCategory::Frontal
        } else if ay >= ap {
            if self.yaw < 0.0 { PoseCategory::Left } else { PoseCategory::Right }
        } else if self.pitch > 0.0 {
            PoseCategory::Up
        } else {
            PoseCategory::Down
        }
    }
}

/// Coarse pose bucket used for anchor diversity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseCategory {
    Frontal,
    Left,
    Right,
    Up,
    Down,
}

impl PoseCategory {
    pub const ALL: [PoseCategory; 5] = [
        PoseCategory::Frontal,
        PoseCategory::Left,
        PoseCategory::Right,
        PoseCategory::Up,
        PoseCategory::Down,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoseCategory::Frontal => "frontal",
            PoseCategory::Left => "left",
            PoseCategory::Right => "right",
            PoseCategory::Up => "up",
            PoseCategory::Down => "down",
        }
    }
}

impl std::fmt::Display for PoseCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-face quality sub-scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityScores {
    pub size: f32,
    pub pose: f32,
    pub sharpness: f32,
    pub brightness: f32,
    pub eyes: f32,
}

impl QualityScores {
    pub const W_SIZE: f32 = 0.20;
    pub const W_POSE: f32 = 0.25;
    pub const W_SHARPNESS: f32 = 0.25;
    pub const W_BRIGHTNESS: f32 = 0.10;
    pub const W_EYES: f32 = 0.20;

    /// Weighted combination of the sub-scores.
    pub fn overall(&self) -> f32 {
        (self.size * Self::W_SIZE
            + self.pose * Self::W_POSE
            + self.sharpness * Self::W_SHARPNESS
            + self.brightness * Self::W_BRIGHTNESS
            + self.eyes * Self::W_EYES)
            .clamp(0.0, 1.0)
    }

    /// Uniform scores, handy for synthetic faces.
    pub fn uniform(v: f32) -> Self {
        let v = v.clamp(0.0, 1.0);
        Self {
            size: v,
            pose: v,
            sharpness: v,
            brightness: v,
            eyes: v,
        }
    }
}

/// A face found by a [`crate::FaceDetector`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub pose: Option<PoseAngles>,
    /// Eye-visibility score in `[0, 1]` when the detector provides landmarks.
    pub eyes: Option<f32>,
}

/// An embedded face ready for clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub pose: PoseAngles,
    pub quality: QualityScores,
    /// Unit-length embedding.
    pub vector: Vec<f32>,
    /// True when produced by the model-free fallback.
    pub fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_category() {
        let p = |yaw, pitch| PoseAngles { yaw, pitch, roll: 0.0 }.category();
        assert_eq!(p(0.0, 0.0), PoseCategory::Frontal);
        assert_eq!(p(-19.0, 10.0), PoseCategory::Frontal);
        assert_eq!(p(-45.0, 10.0), PoseCategory::Left);
        assert_eq!(p(45.0, -30.0), PoseCategory::Right);
        assert_eq!(p(5.0, 30.0), PoseCategory::Up);
        assert_eq!(p(5.0, -30.0), PoseCategory::Down);
    }

    #[test]
    fn test_overall_weights_sum_to_one() {
        assert!((QualityScores::uniform(1.0).overall() - 1.0).abs() < 1e-6);
        assert_eq!(QualityScores::default().overall(), 0.0);
        let eyes_only = QualityScores {
            eyes: 1.0,
            ..QualityScores::default()
        };
        assert!((eyes_only.overall() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_bbox_to_pixels_clamps() {
        let b = BoundingBox {
            x: 0.75,
            y: 0.0,
            width: 0.25,
            height: 0.5,
        };
        let (x, y, w, h) = b.to_pixels(100, 200, 0.5);
        assert_eq!((x, y), (62, 0));
        assert_eq!(x + w, 100);
        assert_eq!(h, 150);
    }
}
