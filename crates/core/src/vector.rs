//! Vector kernels
//!
//! Vectors are fixed-dimension dense `f64` payloads, immutable after
//! construction. The kernels here back the numeric primitives exposed to
//! the language; dimension mismatches are `None`, not errors, and the VM
//! turns them into type errors at the call site.

/// Dot product; `None` on dimension mismatch
pub fn dot(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

/// Euclidean magnitude
pub fn magnitude(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Cosine similarity; `None` on dimension mismatch or a zero vector
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    let d = dot(a, b)?;
    let ma = magnitude(a);
    let mb = magnitude(b);
    if ma == 0.0 || mb == 0.0 {
        return None;
    }
    Some(d / (ma * mb))
}

/// Euclidean distance; `None` on dimension mismatch
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt(),
    )
}
