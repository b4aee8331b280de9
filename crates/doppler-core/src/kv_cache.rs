//! KV Cache: per-layer key/value storage with lockstep sequence-length
//! tracking (spec §4.7).
//!
//! `append` writes the new token range speculatively but does not advance
//! `seqLen`; the pipeline's `run_layers` calls [`KvCache::commit`] exactly
//! once per decode/prefill step, after every layer's append has succeeded,
//! matching spec §4.8's "no partial KV writes... achieved by appending only
//! after attention inputs are built, then committing seqLen" all-or-nothing
//! rule.
//! A single shared counter (rather than one per layer) makes the "seqLen
//! is identical across all layers" invariant (spec §4.7) structural instead
//! of an assertion.

use std::sync::Mutex;

use crate::error::{DopplerError, Result};
use crate::kernels::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvLayout {
    /// One flat ring buffer per layer. The only layout this core
    /// implements.
    Contiguous,
    /// Reserved for a future block-table implementation (grounded in the
    /// pack's block/tier KV design); GPU-resident, single-tier KV is this
    /// core's whole scope, so `Paged` is declared but not constructible.
    Paged,
}

#[derive(Debug, Clone)]
pub struct KvCacheStats {
    pub allocated_bytes: u64,
    pub used_bytes: u64,
    pub efficiency: f64,
    pub seq_len: usize,
    pub max_seq_len: usize,
    pub layout: KvLayout,
}

struct LayerStorage {
    k: Vec<f32>,
    v: Vec<f32>,
}

pub struct KvCache {
    layers: Vec<Mutex<LayerStorage>>,
    seq_len: Mutex<usize>,
    max_seq_len: usize,
    num_kv_heads: usize,
    head_dim: usize,
    layout: KvLayout,
}

impl KvCache {
    pub fn new(num_layers: usize, max_seq_len: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        let per_layer_len = max_seq_len * num_kv_heads * head_dim;
        let layers = (0..num_layers)
            .map(|_| {
                Mutex::new(LayerStorage {
                    k: vec![0.0; per_layer_len],
                    v: vec![0.0; per_layer_len],
                })
            })
            .collect();
        Self {
            layers,
            seq_len: Mutex::new(0),
            max_seq_len,
            num_kv_heads,
            head_dim,
            layout: KvLayout::Contiguous,
        }
    }

    pub fn seq_len(&self) -> usize {
        *self.seq_len.lock().expect("kv cache mutex poisoned")
    }

    fn row_width(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Writes `k_new`/`v_new` (each `[new_tokens, num_kv_heads*head_dim]`)
    /// into the slots immediately after the current (not-yet-committed)
    /// sequence length for `layer_idx`. Fails with `CapacityExceeded`
    /// without writing anything if the range would overflow `max_seq_len`.
    pub fn append(&self, layer_idx: usize, k_new: &Tensor, v_new: &Tensor, new_tokens: usize) -> Result<()> {
        let seq_len = self.seq_len();
        if seq_len + new_tokens > self.max_seq_len {
            return Err(DopplerError::CapacityExceeded(format!(
                "kv cache layer {layer_idx}: {seq_len} + {new_tokens} exceeds max_seq_len {}",
                self.max_seq_len
            )));
        }
        let row_width = self.row_width();
        if k_new.data.len() != new_tokens * row_width || v_new.data.len() != new_tokens * row_width {
            return Err(DopplerError::ShapeMismatch(format!(
                "kv cache append expected {new_tokens} rows of width {row_width}"
            )));
        }
        let mut layer = self.layers[layer_idx].lock().expect("kv cache mutex poisoned");
        let start = seq_len * row_width;
        let end = start + new_tokens * row_width;
        layer.k[start..end].copy_from_slice(&k_new.data);
        layer.v[start..end].copy_from_slice(&v_new.data);
        Ok(())
    }

    /// Advances the shared `seqLen` by `new_tokens`. Called once per step,
    /// after every layer's `append` has succeeded.
    pub fn commit(&self, new_tokens: usize) -> Result<()> {
        let mut seq_len = self.seq_len.lock().expect("kv cache mutex poisoned");
        let next = *seq_len + new_tokens;
        if next > self.max_seq_len {
            return Err(DopplerError::CapacityExceeded(format!(
                "commit would advance seqLen to {next}, exceeding max_seq_len {}",
                self.max_seq_len
            )));
        }
        *seq_len = next;
        Ok(())
    }

    /// Returns the valid `[0, seqLen)` prefix of `layer_idx`'s K and V, as
    /// `[seqLen, num_kv_heads*head_dim]` tensors.
    pub fn read(&self, layer_idx: usize) -> Result<(Tensor, Tensor, usize)> {
        self.read_through(layer_idx, 0)
    }

    /// Returns `[0, seqLen + pending_tokens)` of `layer_idx`'s K and V. The
    /// current step's `append` has already written `pending_tokens` rows
    /// past `seqLen` before `commit` advances it, so passing this step's
    /// `new_tokens` here is what lets attention see the current token's own
    /// just-appended K/V (spec §4.8: attention reads the cache *after* the
    /// append, before `seqLen` itself is advanced).
    pub fn read_through(&self, layer_idx: usize, pending_tokens: usize) -> Result<(Tensor, Tensor, usize)> {
        let seq_len = self.seq_len() + pending_tokens;
        let row_width = self.row_width();
        let layer = self.layers[layer_idx].lock().expect("kv cache mutex poisoned");
        let k = Tensor::new(vec![seq_len, row_width], layer.k[..seq_len * row_width].to_vec())?;
        let v = Tensor::new(vec![seq_len, row_width], layer.v[..seq_len * row_width].to_vec())?;
        Ok((k, v, seq_len))
    }

    /// Sets `seqLen` to zero for every layer. Does not free or zero the
    /// underlying storage (spec §4.7: "does not free buffers").
    pub fn reset(&self) {
        *self.seq_len.lock().expect("kv cache mutex poisoned") = 0;
    }

    pub fn stats(&self) -> KvCacheStats {
        let seq_len = self.seq_len();
        let row_width = self.row_width();
        let allocated_bytes = (self.layers.len() * self.max_seq_len * row_width * 2 * 4) as u64;
        let used_bytes = (self.layers.len() * seq_len * row_width * 2 * 4) as u64;
        let efficiency = if allocated_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / allocated_bytes as f64
        };
        KvCacheStats {
            allocated_bytes,
            used_bytes,
            efficiency,
            seq_len,
            max_seq_len: self.max_seq_len,
            layout: self.layout,
        }
    }
}
