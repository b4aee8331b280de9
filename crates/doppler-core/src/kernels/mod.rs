//! Kernel Library: parameterized compute primitives (spec §4.6).
//!
//! Every kernel here is an exact-arithmetic CPU reference implementation —
//! the `ComputeBackend::Cpu` path described in the ambient-stack notes,
//! used by every test in this crate since no GPU adapter is assumed in CI.
//! A `webgpu`-feature build dispatches the same logical kernel as a real
//! compute-pipeline submission (see [`crate::device::Device`]); the shape
//! and dtype validation contract below is identical on both paths.
//!
//! Kernels operate on a small in-memory [`Tensor`] rather than directly on
//! pooled [`crate::buffer_pool::Buffer`]s: weights are decoded from their
//! resident buffer's bytes into `Tensor`s at the point a kernel needs them
//! (per spec §4.6, "weights are decoded on the fly inside the kernel"),
//! and kernel outputs are written back into pool-acquired buffers by the
//! caller (the layer engine), not by the kernel itself.

pub mod attention;
pub mod gather;
pub mod matmul;
pub mod rmsnorm;
pub mod rope;
pub mod sampling;
pub mod swiglu;

use crate::error::{DopplerError, Result};

/// A dense, row-major, f32 tensor. The logical shape is whatever the
/// manifest declares; quantized storage dtypes are unpacked to this
/// representation before any kernel touches them.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DopplerError::ShapeMismatch(format!(
                "tensor shape {shape:?} implies {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: vec![0.0; len],
            shape,
        }
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    pub fn cols(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(self.data.len())
    }

    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let cols = self.cols();
        &mut self.data[i * cols..(i + 1) * cols]
    }
}

/// Checked shape equality used at the top of every kernel wrapper, per
/// spec §4.6's "(i) validate shapes/dtypes at the boundary".
pub fn require_shape(label: &str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual != expected {
        return Err(DopplerError::ShapeMismatch(format!(
            "{label}: expected shape {expected:?}, got {actual:?}"
        )));
    }
    Ok(())
}
