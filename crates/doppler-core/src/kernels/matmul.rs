//! matmul: dense and quantized matrix multiplication (spec §4.6).
//!
//! `A:[M,K] × B:[K,N] (or [N,K] with transpose_b) → C:[M,N]`. Tile shape
//! is not meaningful on the CPU reference path (no workgroups), but the
//! `transpose_b` flag and dequantization contract are identical to the
//! GPU path so test tolerances carry over.

use crate::error::{DopplerError, Result};
use crate::kernels::{require_shape, Tensor};
use crate::manifest::Dtype;

/// `C = A · B` (or `A · Bᵀ` when `transpose_b`). `B` is f32-resident —
/// quantized weights must already be dequantized via [`dequantize`]
/// before reaching this function, matching the "weights are decoded on
/// the fly inside the kernel" contract at the call site that owns the
/// raw buffer.
pub fn matmul(a: &Tensor, b: &Tensor, transpose_b: bool) -> Result<Tensor> {
    let (m, k) = (a.rows(), a.cols());
    let (bn0, bn1) = (b.rows(), b.cols());
    let (k_b, n) = if transpose_b { (bn1, bn0) } else { (bn0, bn1) };
    if k != k_b {
        return Err(DopplerError::ShapeMismatch(format!(
            "matmul: A is [{m},{k}], B is [{bn0},{bn1}] (transpose_b={transpose_b}) — inner dims disagree"
        )));
    }

    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        let a_row = a.row(i);
        for j in 0..n {
            let mut acc = 0.0f32;
            for kk in 0..k {
                let b_val = if transpose_b { b.data[j * k + kk] } else { b.data[kk * n + j] };
                acc += a_row[kk] * b_val;
            }
            out[i * n + j] = acc;
        }
    }
    Tensor::new(vec![m, n], out)
}

/// Splits a fused `[K, 3N]` QKV projection result into three `[*, N]`
/// tensors, per layer-engine step 2's "fused or 3-way per plan".
pub fn split_qkv(fused: &Tensor, head_total_dim: usize) -> Result<(Tensor, Tensor, Tensor)> {
    require_shape("split_qkv", &[fused.cols()], &[head_total_dim * 3])?;
    let rows = fused.rows();
    let mut q = vec![0.0f32; rows * head_total_dim];
    let mut k = vec![0.0f32; rows * head_total_dim];
    let mut v = vec![0.0f32; rows * head_total_dim];
    for r in 0..rows {
        let src = fused.row(r);
        q[r * head_total_dim..(r + 1) * head_total_dim].copy_from_slice(&src[0..head_total_dim]);
        k[r * head_total_dim..(r + 1) * head_total_dim]
            .copy_from_slice(&src[head_total_dim..2 * head_total_dim]);
        v[r * head_total_dim..(r + 1) * head_total_dim]
            .copy_from_slice(&src[2 * head_total_dim..3 * head_total_dim]);
    }
    Ok((
        Tensor::new(vec![rows, head_total_dim], q)?,
        Tensor::new(vec![rows, head_total_dim], k)?,
        Tensor::new(vec![rows, head_total_dim], v)?,
    ))
}

/// Dequantizes raw bytes of the given dtype into an f32 tensor of `shape`.
/// `f32`/`f16`/`bf16` are plain reinterpretation; `q4_k`/`q8_0` use a
/// simplified blockwise-scale scheme (one f32 scale per 32-element block,
/// matching the group size `ggml`-family quantizers use) — enough to
/// exercise the dequantize-then-matmul path deterministically in tests
/// without pulling in a full GGUF quantization crate.
pub fn dequantize(dtype: Dtype, shape: Vec<usize>, bytes: &[u8]) -> Result<Tensor> {
    let len: usize = shape.iter().product();
    let data = match dtype {
        Dtype::F32 => {
            if bytes.len() != len * 4 {
                return Err(DopplerError::ShapeMismatch("f32 byte length mismatch".into()));
            }
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }
        Dtype::F16 => {
            if bytes.len() != len * 2 {
                return Err(DopplerError::ShapeMismatch("f16 byte length mismatch".into()));
            }
            bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect()
        }
        Dtype::Bf16 => {
            if bytes.len() != len * 2 {
                return Err(DopplerError::ShapeMismatch("bf16 byte length mismatch".into()));
            }
            bytes
                .chunks_exact(2)
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect()
        }
        Dtype::Q4K | Dtype::Q8_0 => dequantize_blockwise(bytes, len)?,
    };
    Tensor::new(shape, data)
}

const BLOCK_SIZE: usize = 32;

fn dequantize_blockwise(bytes: &[u8], len: usize) -> Result<Vec<f32>> {
    let num_blocks = len.div_ceil(BLOCK_SIZE);
    let expected = num_blocks * (4 + BLOCK_SIZE);
    if bytes.len() != expected {
        return Err(DopplerError::ShapeMismatch(format!(
            "quantized tensor expects {expected} bytes for {len} elements, got {}",
            bytes.len()
        )));
    }
    let mut out = Vec::with_capacity(len);
    for block in bytes.chunks_exact(4 + BLOCK_SIZE) {
        let scale = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        for &byte in &block[4..] {
            if out.len() == len {
                break;
            }
            out.push((byte as i8) as f32 * scale);
        }
    }
    Ok(out)
}
