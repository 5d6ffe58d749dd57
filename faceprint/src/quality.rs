//! Image-derived quality sub-scores.

use image::GrayImage;

use crate::types::{PoseAngles, QualityScores};

/// Face side (pixels) at or below which the size score is 0.
pub const SIZE_MIN_PX: f32 = 32.0;
/// Face side (pixels) at or above which the size score is 1.
pub const SIZE_FULL_PX: f32 = 160.0;

/// Laplacian variance giving a sharpness score of 0.5.
const SHARPNESS_HALF: f64 = 100.0;

/// Score in `[0, 1]` from the shorter face side in pixels.
pub fn size_score(width_px: u32, height_px: u32) -> f32 {
    let side = width_px.min(height_px) as f32;
    ((side - SIZE_MIN_PX) / (SIZE_FULL_PX - SIZE_MIN_PX)).clamp(0.0, 1.0)
}

/// 1 for a frontal face, falling toward 0 as the head turns.
pub fn pose_score(p: &PoseAngles) -> f32 {
    let penalty = p.yaw.abs() / 90.0 * 0.6 + p.pitch.abs() / 90.0 * 0.3 + p.roll.abs() / 90.0 * 0.1;
    (1.0 - penalty).clamp(0.0, 1.0)
}

/// Variance of the 4-neighbor Laplacian mapped to `[0, 1)`.
pub fn sharpness_score(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| gray.get_pixel(x, y).0[0] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }
    let mean = sum / n;
    let var = (sum_sq / n - mean * mean).max(0.0);
    (var / (var + SHARPNESS_HALF)) as f32
}

/// 1 at mid-gray, 0 for fully black or white crops.
pub fn brightness_score(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    let n = (w as usize) * (h as usize);
    if n == 0 {
        return 0.0;
    }
    let mean = gray.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n as f64;
    (1.0 - ((mean - 127.5).abs() / 127.5)).clamp(0.0, 1.0) as f32
}

/// Scores a cropped face.
pub fn assess(gray: &GrayImage, pose: &PoseAngles, eyes: f32) -> QualityScores {
    let (w, h) = gray.dimensions();
    QualityScores {
        size: size_score(w, h),
        pose: pose_score(pose),
        sharpness: sharpness_score(gray),
        brightness: brightness_score(gray),
        eyes: eyes.clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn flat(v: u8, side: u32) -> GrayImage {
        ImageBuffer::from_pixel(side, side, Luma([v]))
    }

    fn checker(side: u32) -> GrayImage {
        ImageBuffer::from_fn(side, side, |x, y| Luma([if (x + y) % 2 == 0 { 30 } else { 220 }]))
    }

    #[test]
    fn test_size_score_ramp() {
        assert_eq!(size_score(20, 200), 0.0);
        assert_eq!(size_score(400, 300), 1.0);
        assert!((size_score(96, 96) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sharpness_orders_textures() {
        assert_eq!(sharpness_score(&flat(128, 32)), 0.0);
        assert!(sharpness_score(&checker(32)) > 0.9);
    }

    #[test]
    fn test_brightness() {
        assert!(brightness_score(&flat(128, 8)) > 0.99);
        assert_eq!(brightness_score(&flat(0, 8)), 0.0);
        assert_eq!(brightness_score(&flat(255, 8)), 0.0);
    }

    #[test]
    fn test_pose_score() {
        assert_eq!(pose_score(&PoseAngles::default()), 1.0);
        let turned = PoseAngles {
            yaw: 90.0,
            pitch: 0.0,
            roll: 0.0,
        };
        assert!((pose_score(&turned) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_assess_in_unit_range() {
        let q = assess(&checker(64), &PoseAngles::default(), 1.5);
        for s in [q.size, q.pose, q.sharpness, q.brightness, q.eyes, q.overall()] {
            assert!((0.0..=1.0).contains(&s));
        }
        assert_eq!(q.eyes, 1.0);
    }
}
