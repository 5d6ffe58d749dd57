//! Similarity and distance over embedding vectors.
//!
//! The index stores unit vectors only, so cosine similarity reduces to the
//! dot product and the distance is `1 - dot`, clamped to `[0, 2]`.
//! Accumulation runs in f64 to keep self-distance within float noise of 0.

/// Dot product with f64 accumulation.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum::<f64>() as f32
}

/// Euclidean norm.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|&x| x as f64 * x as f64).sum::<f64>().sqrt() as f32
}

/// Normalizes a vector to unit length in place.
/// Returns false (leaving `v` untouched) for the zero vector.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let n = v.iter().map(|&x| x as f64 * x as f64).sum::<f64>().sqrt();
    if n == 0.0 || !n.is_finite() {
        return false;
    }
    let scale = 1.0 / n;
    for x in v.iter_mut() {
        *x = (*x as f64 * scale) as f32;
    }
    true
}

/// Returns a unit-length copy of `v`, or None for the zero vector.
pub fn normalized(v: &[f32]) -> Option<Vec<f32>> {
    let mut out = v.to_vec();
    l2_normalize(&mut out).then_some(out)
}

/// True when `v` has unit length within `tol`.
pub fn is_unit(v: &[f32], tol: f32) -> bool {
    (norm(v) - 1.0).abs() <= tol
}

/// Cosine similarity for arbitrary (not necessarily unit) vectors.
/// Returns 0 for zero vectors or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let (na, nb) = (norm(a), norm(b));
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
}

/// Cosine distance for arbitrary vectors: `1 - cosine_similarity`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Distance between two unit vectors: `1 - dot`, in `[0, 2]`.
pub fn unit_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - dot(a, b)).clamp(0.0, 2.0)
}

/// Converts a distance back to a similarity.
pub fn similarity_from_distance(d: f32) -> f32 {
    1.0 - d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_dot_equals_cosine() {
        let mut a = vec![0.3, -1.2, 4.0, 0.5];
        let mut b = vec![1.0, 0.2, 2.5, -0.7];
        let cos = cosine_similarity(&a, &b);
        l2_normalize(&mut a);
        l2_normalize(&mut b);
        assert!((dot(&a, &b) - cos).abs() < 1e-6);
    }

    #[test]
    fn distance_zero_iff_identical_direction() {
        let a = normalized(&[1.0, 2.0, 3.0]).unwrap();
        let b = normalized(&[2.0, 4.0, 6.0]).unwrap();
        let c = normalized(&[3.0, 2.0, 1.0]).unwrap();
        assert!(unit_distance(&a, &b) < 1e-6);
        assert!(unit_distance(&a, &c) > 1e-3);
    }

    #[test]
    fn distance_bounds() {
        let a = [1.0, 0.0];
        let b = [-1.0, 0.0];
        let o = [0.0, 1.0];
        assert!((unit_distance(&a, &b) - 2.0).abs() < 1e-6);
        assert!((unit_distance(&a, &o) - 1.0).abs() < 1e-6);
        assert!(unit_distance(&a, &a) >= 0.0);
    }

    #[test]
    fn zero_vector_is_rejected() {
        let mut z = [0.0f32; 3];
        assert!(!l2_normalize(&mut z));
        assert!(normalized(&z).is_none());
        assert_eq!(cosine_similarity(&z, &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn unit_check() {
        let v = normalized(&[3.0, 4.0]).unwrap();
        assert!(is_unit(&v, 1e-5));
        assert!(!is_unit(&[3.0, 4.0], 1e-5));
        assert!((v[0] - 0.6).abs() < 1e-6);
    }
}
