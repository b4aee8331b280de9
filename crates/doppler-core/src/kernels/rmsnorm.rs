//! rmsnorm: root-mean-square layer normalization (spec §4.6).
//!
//! `Y = X · rsqrt(mean(X²) + eps) · W`, applied independently per row of
//! `X:[…,D]` against a shared `W:[D]`.

use crate::error::Result;
use crate::kernels::{require_shape, Tensor};

pub fn rmsnorm(x: &Tensor, w: &Tensor, eps: f32) -> Result<Tensor> {
    let d = x.cols();
    require_shape("rmsnorm", &w.shape, &[d])?;

    let mut out = vec![0.0f32; x.data.len()];
    for r in 0..x.rows() {
        let row = x.row(r);
        let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / d as f32;
        let scale = (mean_sq + eps).sqrt().recip();
        let out_row = &mut out[r * d..(r + 1) * d];
        for i in 0..d {
            out_row[i] = row[i] * scale * w.data[i];
        }
    }
    Tensor::new(x.shape.clone(), out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_weight_normalizes_to_unit_rms() {
        let x = Tensor::new(vec![1, 4], vec![2.0, 2.0, 2.0, 2.0]).unwrap();
        let w = Tensor::new(vec![4], vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let y = rmsnorm(&x, &w, 1e-6).unwrap();
        for v in y.data {
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn zero_row_does_not_divide_by_zero() {
        let x = Tensor::new(vec![1, 4], vec![0.0, 0.0, 0.0, 0.0]).unwrap();
        let w = Tensor::new(vec![4], vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let y = rmsnorm(&x, &w, 1e-6).unwrap();
        assert!(y.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rejects_weight_shape_mismatch() {
        let x = Tensor::new(vec![1, 4], vec![1.0; 4]).unwrap();
        let w = Tensor::new(vec![3], vec![1.0; 3]).unwrap();
        assert!(rmsnorm(&x, &w, 1e-6).is_err());
    }
}
