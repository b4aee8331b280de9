//! flash-attention: tiled, numerically-stable scaled dot-product attention
//! with causal, sliding-window, and soft-capped variants (spec §4.6).
//!
//! The CPU reference path is not literally tiled (there is no workgroup
//! concept to tile across); it reproduces the same row-max-subtracted
//! softmax numerics a tiled GPU kernel would so the two implementations
//! share a tolerance.

use crate::error::{DopplerError, Result};
use crate::kernels::Tensor;
use crate::manifest::AttentionKind;

#[derive(Debug, Clone, Copy)]
pub struct AttentionMask {
    pub kind: AttentionKind,
    pub window: Option<usize>,
    pub softcap: Option<f32>,
}

/// `Q:[Tq,D]`, `K:[Tk,D]`, `V:[Tk,D] → O:[Tq,D]`. `q_positions[i]` is the
/// absolute sequence position of query row `i`, used for causal/sliding
/// masking against the (already absolute) key positions `0..Tk`.
pub fn flash_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    q_positions: &[usize],
    mask: AttentionMask,
    scale: f32,
) -> Result<Tensor> {
    let d = q.cols();
    if k.cols() != d || v.cols() != d {
        return Err(DopplerError::ShapeMismatch(format!(
            "attention: Q/K/V last dim mismatch ({}/{}/{})",
            d,
            k.cols(),
            v.cols()
        )));
    }
    if k.rows() != v.rows() {
        return Err(DopplerError::ShapeMismatch(
            "attention: K and V must have matching sequence length".into(),
        ));
    }
    if q_positions.len() != q.rows() {
        return Err(DopplerError::ShapeMismatch(
            "attention: one position per query row is required".into(),
        ));
    }

    let tk = k.rows();
    let mut out = vec![0.0f32; q.rows() * d];

    for qi in 0..q.rows() {
        let q_row = q.row(qi);
        let q_pos = q_positions[qi];

        let mut scores = vec![f32::NEG_INFINITY; tk];
        for ki in 0..tk {
            if !key_visible(mask, q_pos, ki) {
                continue;
            }
            let k_row = k.row(ki);
            let mut dot = 0.0f32;
            for t in 0..d {
                dot += q_row[t] * k_row[t];
            }
            let mut s = dot * scale;
            if let Some(cap) = mask.softcap {
                s = (s / cap).tanh() * cap;
            }
            scores[ki] = s;
        }

        let row_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut weights = vec![0.0f32; tk];
        let mut sum = 0.0f32;
        if row_max.is_finite() {
            for (ki, s) in scores.iter().enumerate() {
                if s.is_finite() {
                    let w = (s - row_max).exp();
                    weights[ki] = w;
                    sum += w;
                }
            }
        }

        let out_row = &mut out[qi * d..(qi + 1) * d];
        if sum > 0.0 {
            for ki in 0..tk {
                if weights[ki] == 0.0 {
                    continue;
                }
                let w = weights[ki] / sum;
                let v_row = v.row(ki);
                for t in 0..d {
                    out_row[t] += w * v_row[t];
                }
            }
        }
    }

    Tensor::new(vec![q.rows(), d], out)
}

fn key_visible(mask: AttentionMask, q_pos: usize, k_pos: usize) -> bool {
    match mask.kind {
        AttentionKind::Full => k_pos <= q_pos,
        AttentionKind::Gqa => k_pos <= q_pos,
        AttentionKind::Sliding => {
            let window = mask.window.unwrap_or(usize::MAX);
            k_pos <= q_pos && q_pos - k_pos < window
        }
        AttentionKind::Hybrid => {
            // Hybrid layers fall back to the sliding window when configured,
            // full causal otherwise.
            if let Some(window) = mask.window {
                k_pos <= q_pos && q_pos - k_pos < window
            } else {
                k_pos <= q_pos
            }
        }
    }
}
