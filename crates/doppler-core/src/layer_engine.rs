//! Layer Engine: executes one transformer block, prefill or decode,
//! dispatching kernels in the manifest's planned order (spec §4.8).
//!
//! The same engine handles both prefill (`T = |prompt|`, full causal
//! dispatch) and decode (`T = 1`, attention reads the whole cached
//! prefix) — only `T` and the KV read length differ, per spec §4.8
//! "Prefill vs decode".

use crate::error::{DopplerError, Result};
use crate::kernels::attention::{flash_attention, AttentionMask};
use crate::kernels::matmul::matmul;
use crate::kernels::rmsnorm::rmsnorm;
use crate::kernels::rope::apply_rope;
use crate::kernels::swiglu::gated_activation;
use crate::kernels::Tensor;
use crate::kv_cache::KvCache;
use crate::manifest::{Architecture, InferencePlan, StepKind};

/// One decoder layer's resident weights, already dequantized to f32 (spec
/// §4.6: dequantization happens once per weight, at the point a kernel
/// needs it — the pipeline owns that decode step; the layer engine only
/// consumes the resulting tensors).
pub struct LayerWeights {
    pub attn_norm: Tensor,
    pub ffn_norm: Tensor,
    pub w_q: Tensor,
    pub w_k: Tensor,
    pub w_v: Tensor,
    pub w_o: Tensor,
    pub w_gate: Tensor,
    pub w_up: Tensor,
    pub w_down: Tensor,
}

/// Executes `layer_idx` over hidden states `x:[T,H]`, returning `y:[T,H]`.
/// `q_positions` gives each row's absolute sequence position (needed for
/// RoPE and for causal/sliding masking against the cache).
pub fn execute_layer(
    layer_idx: usize,
    x: &Tensor,
    weights: &LayerWeights,
    kv: &KvCache,
    arch: &Architecture,
    q_positions: &[usize],
    plan: &InferencePlan,
) -> Result<Tensor> {
    let new_tokens = x.rows();
    let rope_positions: Vec<u32> = q_positions.iter().map(|&p| p as u32).collect();

    let mut x_current = x.clone();
    let mut x_norm: Option<Tensor> = None;
    let mut q: Option<Tensor> = None;
    let mut k: Option<Tensor> = None;
    let mut v: Option<Tensor> = None;
    let mut attn_out: Option<Tensor> = None;
    let mut ffn_out: Option<Tensor> = None;

    for step in &plan.steps {
        match step {
            StepKind::AttnNorm => {
                x_norm = Some(rmsnorm(&x_current, &weights.attn_norm, arch.norm_eps)?);
            }
            StepKind::QkvProjection => {
                let xn = x_norm
                    .as_ref()
                    .ok_or_else(|| DopplerError::ShapeMismatch("qkv_projection before attn_norm".into()))?;
                let mut qt = matmul(xn, &weights.w_q, false)?;
                let mut kt = matmul(xn, &weights.w_k, false)?;
                let vt = matmul(xn, &weights.w_v, false)?;
                apply_rope(&mut qt, &rope_positions, arch.rope_base)?;
                apply_rope(&mut kt, &rope_positions, arch.rope_base)?;
                q = Some(qt);
                k = Some(kt);
                v = Some(vt);
            }
            StepKind::Rope => {
                // RoPE is fused into QkvProjection above since it must run
                // before the KV append that follows; this step exists for
                // manifests whose plan separates it explicitly and is a
                // no-op in that case.
            }
            StepKind::KvAppend => {
                let k_new = k.as_ref().ok_or_else(|| DopplerError::ShapeMismatch("kv_append before qkv_projection".into()))?;
                let v_new = v.as_ref().ok_or_else(|| DopplerError::ShapeMismatch("kv_append before qkv_projection".into()))?;
                kv.append(layer_idx, k_new, v_new, new_tokens)?;
            }
            StepKind::Attention => {
                let q_ref = q.as_ref().ok_or_else(|| DopplerError::ShapeMismatch("attention before qkv_projection".into()))?;
                // `seqLen` isn't advanced until `run_layers` commits after
                // every layer, so the rows this step just appended have to
                // be pulled in explicitly or the current token would never
                // attend to itself.
                let (k_cache, v_cache, _seq_len) = kv.read_through(layer_idx, new_tokens)?;
                let mask = AttentionMask {
                    kind: arch.attention_kind,
                    window: None,
                    softcap: arch.softcap,
                };
                let scale = 1.0 / (arch.head_dim as f32).sqrt();
                attn_out = Some(flash_attention(q_ref, &k_cache, &v_cache, q_positions, mask, scale)?);
            }
            StepKind::OutputProjection => {
                let a = attn_out
                    .as_ref()
                    .ok_or_else(|| DopplerError::ShapeMismatch("output_projection before attention".into()))?;
                attn_out = Some(matmul(a, &weights.w_o, false)?);
            }
            StepKind::ResidualAdd => {
                let a = attn_out
                    .as_ref()
                    .ok_or_else(|| DopplerError::ShapeMismatch("residual_add before output_projection".into()))?;
                x_current = add(&x_current, a)?;
            }
            StepKind::FfnNorm => {
                x_norm = Some(rmsnorm(&x_current, &weights.ffn_norm, arch.norm_eps)?);
            }
            StepKind::Ffn => {
                let xn = x_norm
                    .as_ref()
                    .ok_or_else(|| DopplerError::ShapeMismatch("ffn before ffn_norm".into()))?;
                let gate = matmul(xn, &weights.w_gate, false)?;
                let up = matmul(xn, &weights.w_up, false)?;
                let activated = gated_activation(&gate, &up, arch.activation)?;
                ffn_out = Some(matmul(&activated, &weights.w_down, false)?);
            }
            StepKind::FfnResidualAdd => {
                let f = ffn_out
                    .as_ref()
                    .ok_or_else(|| DopplerError::ShapeMismatch("ffn_residual_add before ffn".into()))?;
                x_current = add(&x_current, f)?;
            }
        }
    }

    Ok(x_current)
}

fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.shape != b.shape {
        return Err(DopplerError::ShapeMismatch(format!(
            "residual add: shapes {:?} and {:?} disagree",
            a.shape, b.shape
        )));
    }
    let data: Vec<f32> = a.data.iter().zip(b.data.iter()).map(|(x, y)| x + y).collect();
    Tensor::new(a.shape.clone(), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ActivationKind, AttentionKind};

    fn identity(n: usize) -> Tensor {
        let mut data = vec![0.0f32; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Tensor::new(vec![n, n], data).unwrap()
    }

    fn dummy_arch() -> Architecture {
        Architecture {
            hidden_dim: 4,
            num_layers: 1,
            num_heads: 1,
            num_kv_heads: 1,
            head_dim: 4,
            ffn_dim: 4,
            vocab: 8,
            max_context: 16,
            rope_base: 10000.0,
            norm_eps: 1e-5,
            activation: ActivationKind::Relu,
            attention_kind: AttentionKind::Full,
            softcap: None,
        }
    }

    #[test]
    fn identity_weights_preserve_shape_and_are_finite() {
        let arch = dummy_arch();
        let weights = LayerWeights {
            attn_norm: Tensor::new(vec![4], vec![1.0; 4]).unwrap(),
            ffn_norm: Tensor::new(vec![4], vec![1.0; 4]).unwrap(),
            w_q: identity(4),
            w_k: identity(4),
            w_v: identity(4),
            w_o: identity(4),
            w_gate: identity(4),
            w_up: identity(4),
            w_down: identity(4),
        };
        let kv = KvCache::new(1, 16, 1, 4);
        let x = Tensor::new(vec![1, 4], vec![1.0, 0.5, -0.5, 2.0]).unwrap();
        let y = execute_layer(0, &x, &weights, &kv, &arch, &[0], &InferencePlan::default()).unwrap();
        assert_eq!(y.shape, vec![1, 4]);
        assert!(y.data.iter().all(|v| v.is_finite()));
        // `execute_layer` only appends; the caller (`Pipeline::run_layers`)
        // commits once after every layer has appended.
        assert_eq!(kv.seq_len(), 0);
        kv.commit(1).unwrap();
        assert_eq!(kv.seq_len(), 1);
    }

    #[test]
    fn multiple_layers_append_at_the_same_offset_before_the_caller_commits() {
        use crate::kv_cache::KvCache;
        let arch = dummy_arch();
        let weights = LayerWeights {
            attn_norm: Tensor::new(vec![4], vec![1.0; 4]).unwrap(),
            ffn_norm: Tensor::new(vec![4], vec![1.0; 4]).unwrap(),
            w_q: identity(4),
            w_k: identity(4),
            w_v: identity(4),
            w_o: identity(4),
            w_gate: identity(4),
            w_up: identity(4),
            w_down: identity(4),
        };
        // Two layers sharing one KV cache, simulating `run_layers` driving
        // both over the same step before committing.
        let kv = KvCache::new(2, 16, 1, 4);
        let x = Tensor::new(vec![1, 4], vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        execute_layer(0, &x, &weights, &kv, &arch, &[0], &InferencePlan::default()).unwrap();
        execute_layer(1, &x, &weights, &kv, &arch, &[0], &InferencePlan::default()).unwrap();
        // Neither layer's append advanced seqLen on its own.
        assert_eq!(kv.seq_len(), 0);
        kv.commit(1).unwrap();
        // One step over a 2-layer model advances seqLen by exactly
        // new_tokens, not num_layers * new_tokens.
        assert_eq!(kv.seq_len(), 1);

        let (k0, _, seq0) = kv.read(0).unwrap();
        let (k1, _, seq1) = kv.read(1).unwrap();
        assert_eq!(seq0, 1);
        assert_eq!(seq1, 1);
        assert_eq!(k0.data.len(), k1.data.len());
    }
}
