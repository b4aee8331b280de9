//! rope: rotary position embedding (spec §4.6).
//!
//! Pairwise rotation on the last dim: `theta_i = base^(-2i/D)`. Applied
//! identically to Q and K, each row rotated by its own absolute position.

use crate::error::{DopplerError, Result};
use crate::kernels::Tensor;

/// Rotates `x:[T,D]` in place per-row using `positions[row]` as the
/// absolute sequence position. `D` must be even (pairwise rotation).
pub fn apply_rope(x: &mut Tensor, positions: &[u32], base: f32) -> Result<()> {
    let d = x.cols();
    if d % 2 != 0 {
        return Err(DopplerError::ShapeMismatch(format!(
            "rope requires an even head dim, got {d}"
        )));
    }
    if positions.len() != x.rows() {
        return Err(DopplerError::ShapeMismatch(format!(
            "rope: {} positions for {} rows",
            positions.len(),
            x.rows()
        )));
    }

    let half = d / 2;
    for r in 0..x.rows() {
        let pos = positions[r] as f32;
        let row = x.row_mut(r);
        for i in 0..half {
            let theta = base.powf(-2.0 * i as f32 / d as f32);
            let angle = pos * theta;
            let (sin, cos) = angle.sin_cos();
            let a = row[i];
            let b = row[i + half];
            row[i] = a * cos - b * sin;
            row[i + half] = a * sin + b * cos;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_zero_is_identity() {
        let mut x = Tensor::new(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let before = x.data.clone();
        apply_rope(&mut x, &[0], 10000.0).unwrap();
        for (a, b) in before.iter().zip(x.data.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn rotation_preserves_pairwise_norm() {
        let mut x = Tensor::new(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let norm_before = (x.data[0].powi(2) + x.data[2].powi(2)).sqrt();
        apply_rope(&mut x, &[5], 10000.0).unwrap();
        let norm_after = (x.data[0].powi(2) + x.data[2].powi(2)).sqrt();
        assert!((norm_before - norm_after).abs() < 1e-3);
    }

    #[test]
    fn rejects_odd_head_dim() {
        let mut x = Tensor::new(vec![1, 3], vec![1.0, 2.0, 3.0]).unwrap();
        assert!(apply_rope(&mut x, &[0], 10000.0).is_err());
    }
}
