//! Deterministic, model-free face embedding.
//!
//! The crop is reduced to a 32x32 grayscale patch and described by:
//!
//! 1. a 16x16 grid of mean-centered, variance-scaled intensities (256 values)
//! 2. 4x4 cells of 8-bin gradient-orientation histograms (128 values)
//! 3. one constant bias term
//!
//! The 385-value descriptor is projected to the target dimension with a
//! seeded Gaussian random matrix and L2-normalized. Equal inputs and seeds
//! always give equal vectors.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use facegroup_vecstore::l2_normalize;

use crate::error::FaceprintError;
use crate::model::FaceEmbedder;

const PATCH: u32 = 32;
const GRID: u32 = 16;
const CELLS: u32 = 4;
const BINS: usize = 8;
const RAW_DIM: usize = (GRID * GRID) as usize + (CELLS * CELLS) as usize * BINS + 1;

/// Default projection seed.
pub const DEFAULT_SEED: u64 = 0x5eed_face;

pub struct FallbackEmbedder {
    dim: usize,
    /// dim x RAW_DIM, row-major.
    projection: Vec<f32>,
}

impl FallbackEmbedder {
    pub fn new(dim: usize, seed: u64) -> Self {
        assert!(dim > 0, "faceprint: dim must be positive");
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (RAW_DIM as f64).sqrt();
        let projection = (0..dim * RAW_DIM)
            .map(|_| (gaussian(&mut rng) * scale) as f32)
            .collect();
        Self { dim, projection }
    }

    /// Raw descriptor before projection.
    fn describe(gray: &GrayImage) -> Vec<f32> {
        let patch = imageops::resize(gray, PATCH, PATCH, FilterType::Triangle);
        let px = |x: u32, y: u32| patch.get_pixel(x, y).0[0] as f32;
        let mut out = Vec::with_capacity(RAW_DIM);

        // Intensity grid (2x2 block means).
        let step = PATCH / GRID;
        let mut grid = Vec::with_capacity((GRID * GRID) as usize);
        for gy in 0..GRID {
            for gx in 0..GRID {
                let mut s = 0.0;
                for dy in 0..step {
                    for dx in 0..step {
                        s += px(gx * step + dx, gy * step + dy);
                    }
                }
                grid.push(s / (step * step) as f32);
            }
        }
        let mean = grid.iter().sum::<f32>() / grid.len() as f32;
        let var = grid.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / grid.len() as f32;
        let std = var.sqrt().max(1.0);
        out.extend(grid.iter().map(|v| (v - mean) / std));

        // Gradient-orientation histograms.
        let cell = PATCH / CELLS;
        for cy in 0..CELLS {
            for cx in 0..CELLS {
                let mut hist = [0.0f32; BINS];
                for y in cy * cell..(cy + 1) * cell {
                    for x in cx * cell..(cx + 1) * cell {
                        let gx = px((x + 1).min(PATCH - 1), y) - px(x.saturating_sub(1), y);
                        let gy = px(x, (y + 1).min(PATCH - 1)) - px(x, y.saturating_sub(1));
                        let mag = (gx * gx + gy * gy).sqrt();
                        if mag == 0.0 {
                            continue;
                        }
                        // Unsigned orientation in [0, pi).
                        let mut theta = gy.atan2(gx);
                        if theta < 0.0 {
                            theta += std::f32::consts::PI;
                        }
                        let bin = ((theta / std::f32::consts::PI) * BINS as f32) as usize;
                        hist[bin.min(BINS - 1)] += mag;
                    }
                }
                let norm = hist.iter().map(|h| h * h).sum::<f32>().sqrt();
                if norm > 0.0 {
                    hist.iter_mut().for_each(|h| *h /= norm);
                }
                out.extend_from_slice(&hist);
            }
        }

        out.push(1.0);
        out
    }

    /// Embeds a grayscale face crop.
    pub fn embed_gray(&self, gray: &GrayImage) -> Result<Vec<f32>, FaceprintError> {
        let (w, h) = gray.dimensions();
        if w == 0 || h == 0 {
            return Err(FaceprintError::EmptyCrop);
        }
        let raw = Self::describe(gray);
        let mut v: Vec<f32> = self
            .projection
            .chunks_exact(RAW_DIM)
            .map(|row| {
                row.iter()
                    .zip(&raw)
                    .map(|(&a, &b)| a as f64 * b as f64)
                    .sum::<f64>() as f32
            })
            .collect();
        if !l2_normalize(&mut v) {
            return Err(FaceprintError::Model("fallback produced a zero vector".into()));
        }
        Ok(v)
    }
}

impl FaceEmbedder for FallbackEmbedder {
    fn embed(&self, face: &DynamicImage) -> Result<Vec<f32>, FaceprintError> {
        self.embed_gray(&face.to_luma8())
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// Standard normal sample via Box-Muller.
fn gaussian(rng: &mut impl Rng) -> f64 {
    loop {
        let u1: f64 = rng.r#gen();
        let u2: f64 = rng.r#gen();
        if u1 > f64::EPSILON {
            return (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegroup_vecstore::{cosine_similarity, is_unit};
    use image::{ImageBuffer, Luma};

    fn face_like(side: u32, shift: u8) -> GrayImage {
        ImageBuffer::from_fn(side, side, |x, y| {
            let cx = x as f32 / side as f32 - 0.5;
            let cy = y as f32 / side as f32 - 0.5;
            let r = (cx * cx + cy * cy).sqrt();
            let eyes = if (cy + 0.15).abs() < 0.05 && (cx.abs() - 0.18).abs() < 0.06 { 60.0 } else { 0.0 };
            let v = 200.0 - r * 220.0 - eyes + shift as f32;
            Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    fn stripes(side: u32) -> GrayImage {
        ImageBuffer::from_fn(side, side, |x, _| Luma([if (x / 4) % 2 == 0 { 20 } else { 235 }]))
    }

    #[test]
    fn test_fallback_deterministic_and_unit() {
        let a = FallbackEmbedder::new(128, DEFAULT_SEED);
        let b = FallbackEmbedder::new(128, DEFAULT_SEED);
        let img = face_like(96, 0);
        let va = a.embed_gray(&img).unwrap();
        assert_eq!(va, b.embed_gray(&img).unwrap());
        assert_eq!(va.len(), 128);
        assert!(is_unit(&va, 1e-4));
    }

    #[test]
    fn test_fallback_similar_inputs_stay_close() {
        let e = FallbackEmbedder::new(128, 7);
        let base = e.embed_gray(&face_like(96, 0)).unwrap();
        let brighter = e.embed_gray(&face_like(120, 10)).unwrap();
        let other = e.embed_gray(&stripes(96)).unwrap();
        let near = cosine_similarity(&base, &brighter);
        let far = cosine_similarity(&base, &other);
        assert!(near > 0.9, "near similarity {near}");
        assert!(near > far + 0.1, "near {near} vs far {far}");
    }

    #[test]
    fn test_fallback_flat_image_is_not_zero() {
        let e = FallbackEmbedder::new(32, 1);
        let flat: GrayImage = ImageBuffer::from_pixel(40, 40, Luma([0u8]));
        assert!(is_unit(&e.embed_gray(&flat).unwrap(), 1e-4));
    }

    #[test]
    fn test_fallback_empty_crop() {
        let e = FallbackEmbedder::new(16, 1);
        let empty: GrayImage = ImageBuffer::new(0, 0);
        assert!(matches!(e.embed_gray(&empty), Err(FaceprintError::EmptyCrop)));
    }

    #[test]
    fn test_gaussian_moments() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 20_000;
        let xs: Vec<f64> = (0..n).map(|_| gaussian(&mut rng)).collect();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }
}
