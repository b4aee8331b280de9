//! gather: embedding table lookup (spec §4.6).
//!
//! `Table:[V,D], ids:[T] → E:[T,D]`.

use crate::error::{DopplerError, Result};
use crate::kernels::Tensor;

pub fn gather(table: &Tensor, ids: &[u32]) -> Result<Tensor> {
    let vocab = table.rows();
    let d = table.cols();
    let mut out = vec![0.0f32; ids.len() * d];
    for (row_idx, &id) in ids.iter().enumerate() {
        if id as usize >= vocab {
            return Err(DopplerError::ShapeMismatch(format!(
                "gather: id {id} out of range for vocab size {vocab}"
            )));
        }
        let src = table.row(id as usize);
        out[row_idx * d..(row_idx + 1) * d].copy_from_slice(src);
    }
    Tensor::new(vec![ids.len(), d], out)
}
