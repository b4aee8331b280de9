//! Manifest: parsed description of one model package (spec §3, §4.2).
//!
//! A [`Manifest`] is frozen once parsed — nothing here exposes a `&mut`
//! path back into a successfully-parsed manifest. `parse_manifest` is the
//! only constructor and it is strict: any schema violation fails with
//! [`DopplerError::InvalidManifest`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DopplerError, Result};

/// Tensor element type. Quantized dtypes decode on the fly inside their
/// matmul kernel (spec §4.6); the logical shape is always the unpacked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    F32,
    F16,
    Bf16,
    Q4K,
    Q8_0,
}

impl Dtype {
    /// Bytes occupied by one logical element once unpacked to f32.
    pub fn unpacked_element_bytes(self) -> usize {
        4
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Dtype::Q4K | Dtype::Q8_0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Transformer,
    Diffusion,
    Energy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    Full,
    Sliding,
    Hybrid,
    Gqa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Silu,
    Gelu,
    Relu,
}

/// `role` classifies a tensor the way `classifyTensorRole` (spec §4.2) does.
/// Block-scoped roles carry their layer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    TokenEmbedding,
    OutputEmbedding,
    AttnQ(u32),
    AttnK(u32),
    AttnV(u32),
    AttnO(u32),
    FfnGate(u32),
    FfnUp(u32),
    FfnDown(u32),
    AttnNorm(u32),
    FfnNorm(u32),
    FinalNorm,
    /// Unclassified; not required by any inference plan step.
    Aux,
}

impl Role {
    pub fn layer(self) -> Option<u32> {
        match self {
            Role::AttnQ(i)
            | Role::AttnK(i)
            | Role::AttnV(i)
            | Role::AttnO(i)
            | Role::FfnGate(i)
            | Role::FfnUp(i)
            | Role::FfnDown(i)
            | Role::AttnNorm(i)
            | Role::FfnNorm(i) => Some(i),
            _ => None,
        }
    }
}

/// Deterministic name → role mapping (spec §4.2). Unclassified tensors get
/// `Role::Aux` and are never required by the inference plan.
pub fn classify_tensor_role(name: &str) -> Role {
    fn block_index(name: &str, prefix: &str) -> Option<u32> {
        let rest = name.strip_prefix(prefix)?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }

    if name == "token_embedding" || name == "tok_emb" || name == "embed_tokens" {
        return Role::TokenEmbedding;
    }
    if name == "lm_head" || name == "output_embedding" {
        return Role::OutputEmbedding;
    }
    if name == "final_norm" || name == "norm" || name == "ln_f" {
        return Role::FinalNorm;
    }
    for prefix in ["block.", "blocks.", "layer.", "layers.", "h."] {
        if let Some(idx) = block_index(name, prefix) {
            let suffix = name[prefix.len()..].trim_start_matches(|c: char| c.is_ascii_digit());
            let suffix = suffix.trim_start_matches('.');
            return match suffix {
                "attn.q" | "q_proj" | "attn_q" => Role::AttnQ(idx),
                "attn.k" | "k_proj" | "attn_k" => Role::AttnK(idx),
                "attn.v" | "v_proj" | "attn_v" => Role::AttnV(idx),
                "attn.o" | "o_proj" | "attn_o" => Role::AttnO(idx),
                "ffn.gate" | "gate_proj" | "ffn_gate" => Role::FfnGate(idx),
                "ffn.up" | "up_proj" | "ffn_up" => Role::FfnUp(idx),
                "ffn.down" | "down_proj" | "ffn_down" => Role::FfnDown(idx),
                "attn_norm" | "ln1" | "input_layernorm" => Role::AttnNorm(idx),
                "ffn_norm" | "ln2" | "post_attention_layernorm" => Role::FfnNorm(idx),
                _ => Role::Aux,
            };
        }
    }
    Role::Aux
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Architecture {
    pub hidden_dim: u32,
    pub num_layers: u32,
    pub num_heads: u32,
    pub num_kv_heads: u32,
    pub head_dim: u32,
    pub ffn_dim: u32,
    pub vocab: u32,
    pub max_context: u32,
    pub rope_base: f32,
    pub norm_eps: f32,
    pub activation: ActivationKind,
    pub attention_kind: AttentionKind,
    pub softcap: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuantizationPolicy {
    pub weights: Dtype,
    pub embeddings: Dtype,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub index: u32,
    pub filename: String,
    pub offset: u64,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub shard_index: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
    pub dtype: Dtype,
    pub shape: Vec<u32>,
    pub role: Role,
}

/// One step of the fixed per-layer execution order (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    AttnNorm,
    QkvProjection,
    Rope,
    KvAppend,
    Attention,
    OutputProjection,
    ResidualAdd,
    FfnNorm,
    Ffn,
    FfnResidualAdd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferencePlan {
    pub steps: Vec<StepKind>,
}

impl Default for InferencePlan {
    fn default() -> Self {
        Self {
            steps: vec![
                StepKind::AttnNorm,
                StepKind::QkvProjection,
                StepKind::Rope,
                StepKind::KvAppend,
                StepKind::Attention,
                StepKind::OutputProjection,
                StepKind::ResidualAdd,
                StepKind::FfnNorm,
                StepKind::Ffn,
                StepKind::FfnResidualAdd,
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerRef {
    pub path: String,
    #[serde(default)]
    pub model_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub model_id: String,
    pub model_type: ModelType,
    pub architecture: Architecture,
    pub quantization: QuantizationPolicy,
    pub shards: Vec<ShardDescriptor>,
    pub tensors: BTreeMap<String, TensorDescriptor>,
    pub tokenizer: TokenizerRef,
    pub inference: InferencePlan,
}

/// Tensor roles that the fixed inference plan always requires, one per
/// decoder layer plus the globals. Used by `parse_manifest` to fail fast
/// with `InvalidManifest` when a required tensor is absent (spec §3's
/// invariant "every tensor required by the inference plan is present").
fn required_roles(arch: &Architecture) -> Vec<Role> {
    let mut roles = vec![Role::TokenEmbedding, Role::FinalNorm, Role::OutputEmbedding];
    for i in 0..arch.num_layers {
        roles.extend([
            Role::AttnQ(i),
            Role::AttnK(i),
            Role::AttnV(i),
            Role::AttnO(i),
            Role::FfnGate(i),
            Role::FfnUp(i),
            Role::FfnDown(i),
            Role::AttnNorm(i),
            Role::FfnNorm(i),
        ]);
    }
    roles
}

/// Strict JSON parse + schema validation (spec §4.2).
pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    let manifest: Manifest = serde_json::from_slice(bytes)
        .map_err(|e| DopplerError::InvalidManifest(format!("json parse failed: {e}")))?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

fn validate_manifest(m: &Manifest) -> Result<()> {
    if m.model_id.is_empty() {
        return Err(DopplerError::InvalidManifest("modelId is empty".into()));
    }
    if m.architecture.num_layers == 0 {
        return Err(DopplerError::InvalidManifest("num_layers must be > 0".into()));
    }

    let total_declared: u64 = m.shards.iter().map(|s| s.size).sum();
    let total_from_last = m
        .shards
        .iter()
        .map(|s| s.offset + s.size)
        .max()
        .unwrap_or(0);
    if total_declared == 0 || total_from_last == 0 {
        return Err(DopplerError::InvalidManifest("shards list is empty".into()));
    }

    let mut by_index = BTreeMap::new();
    for shard in &m.shards {
        if by_index.insert(shard.index, shard).is_some() {
            return Err(DopplerError::InvalidManifest(format!(
                "duplicate shard index {}",
                shard.index
            )));
        }
    }

    // "every tensor range lies entirely inside one shard"; also check that
    // tensors declared against the same shard never overlap in byte range
    // (SPEC_FULL.md's supplementary strengthening).
    let mut ranges_by_shard: BTreeMap<u32, Vec<(u64, u64, &str)>> = BTreeMap::new();
    for (name, tensor) in &m.tensors {
        if tensor.shape.iter().any(|&d| d == 0) {
            return Err(DopplerError::InvalidManifest(format!(
                "tensor {name} has a non-positive dimension"
            )));
        }
        let shard = by_index.get(&tensor.shard_index).ok_or_else(|| {
            DopplerError::InvalidManifest(format!(
                "tensor {name} references unknown shard {}",
                tensor.shard_index
            ))
        })?;
        let end = tensor.byte_offset + tensor.byte_length;
        if end > shard.size {
            return Err(DopplerError::InvalidManifest(format!(
                "tensor {name} location lies outside its declared shard"
            )));
        }
        ranges_by_shard
            .entry(tensor.shard_index)
            .or_default()
            .push((tensor.byte_offset, end, name));
    }
    for (_shard_idx, mut ranges) in ranges_by_shard {
        ranges.sort_by_key(|r| r.0);
        for pair in ranges.windows(2) {
            let (_, prev_end, prev_name) = pair[0];
            let (next_start, _, next_name) = pair[1];
            if next_start < prev_end {
                return Err(DopplerError::InvalidManifest(format!(
                    "tensors {prev_name} and {next_name} overlap in the same shard"
                )));
            }
        }
    }

    let by_role: BTreeMap<Role, &str> = m
        .tensors
        .iter()
        .map(|(name, t)| (t.role, name.as_str()))
        .collect();
    for role in required_roles(&m.architecture) {
        if role != Role::Aux && !by_role.contains_key(&role) {
            return Err(DopplerError::InvalidManifest(format!(
                "inference plan requires a tensor with role {role:?}, none present"
            )));
        }
    }

    Ok(())
}

/// Maps logical tensor names to their `(shard, offset, length, dtype, shape)`
/// location (spec §2's "Tensor Resolver"). A thin read-only view over a
/// parsed [`Manifest`]; it has no state of its own.
pub struct TensorResolver<'m> {
    manifest: &'m Manifest,
}

impl<'m> TensorResolver<'m> {
    pub fn new(manifest: &'m Manifest) -> Self {
        Self { manifest }
    }

    pub fn resolve(&self, name: &str) -> Result<&'m TensorDescriptor> {
        self.manifest
            .tensors
            .get(name)
            .ok_or_else(|| DopplerError::NotFound(format!("tensor {name} not in manifest")))
    }

    pub fn resolve_role(&self, role: Role) -> Option<(&'m str, &'m TensorDescriptor)> {
        self.manifest
            .tensors
            .iter()
            .find(|(_, t)| t.role == role)
            .map(|(n, t)| (n.as_str(), t))
    }

    pub fn shard_for(&self, index: u32) -> Option<&'m ShardDescriptor> {
        self.manifest.shards.iter().find(|s| s.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_manifest_json(num_layers: u32) -> serde_json::Value {
        let mut tensors = serde_json::Map::new();
        let mut insert_tensor = |name: &str, role: serde_json::Value, offset: u64, len: u64| {
            tensors.insert(
                name.to_string(),
                serde_json::json!({
                    "shard_index": 0,
                    "byte_offset": offset,
                    "byte_length": len,
                    "dtype": "f32",
                    "shape": [4, 4],
                    "role": role,
                }),
            );
        };
        let mut offset = 0u64;
        let mut push = |name: &str, role: serde_json::Value| {
            insert_tensor(name, role, offset, 64);
            offset += 64;
        };
        push("token_embedding", serde_json::json!("token_embedding"));
        push("final_norm", serde_json::json!("final_norm"));
        push("lm_head", serde_json::json!("output_embedding"));
        for i in 0..num_layers {
            push("q", serde_json::json!({"attn_q": i}));
            push("k", serde_json::json!({"attn_k": i}));
            push("v", serde_json::json!({"attn_v": i}));
            push("o", serde_json::json!({"attn_o": i}));
            push("gate", serde_json::json!({"ffn_gate": i}));
            push("up", serde_json::json!({"ffn_up": i}));
            push("down", serde_json::json!({"ffn_down": i}));
            push("an", serde_json::json!({"attn_norm": i}));
            push("fn_", serde_json::json!({"ffn_norm": i}));
        }
        // tensors map keys must be unique; rekey with index suffix.
        let mut unique = serde_json::Map::new();
        for (i, (_, v)) in tensors.into_iter().enumerate() {
            unique.insert(format!("t{i}"), v);
        }

        serde_json::json!({
            "model_id": "dummy",
            "model_type": "transformer",
            "architecture": {
                "hidden_dim": 8, "num_layers": num_layers, "num_heads": 1,
                "num_kv_heads": 1, "head_dim": 8, "ffn_dim": 8, "vocab": 16,
                "max_context": 32, "rope_base": 10000.0, "norm_eps": 1e-5,
                "activation": "silu", "attention_kind": "full", "softcap": null
            },
            "quantization": {"weights": "f32", "embeddings": "f32"},
            "shards": [{"index": 0, "filename": "shard_00000.bin", "offset": 0, "size": offset, "sha256": "0".repeat(64)}],
            "tensors": unique,
            "tokenizer": {"path": "tokenizer.json", "model_path": null},
            "inference": {"steps": ["attn_norm", "qkv_projection", "rope", "kv_append", "attention", "output_projection", "residual_add", "ffn_norm", "ffn", "ffn_residual_add"]}
        })
    }

    #[test]
    fn parses_valid_manifest() {
        let json = dummy_manifest_json(2);
        let bytes = serde_json::to_vec(&json).unwrap();
        let manifest = parse_manifest(&bytes).unwrap();
        assert_eq!(manifest.architecture.num_layers, 2);
    }

    #[test]
    fn rejects_missing_required_tensor() {
        let mut json = dummy_manifest_json(1);
        json["tensors"].as_object_mut().unwrap().clear();
        let bytes = serde_json::to_vec(&json).unwrap();
        let err = parse_manifest(&bytes).unwrap_err();
        assert!(matches!(err, DopplerError::InvalidManifest(_)));
    }

    #[test]
    fn rejects_tensor_outside_shard() {
        let mut json = dummy_manifest_json(1);
        let tensors = json["tensors"].as_object_mut().unwrap();
        let (_, first) = tensors.iter_mut().next().unwrap();
        first["byte_offset"] = serde_json::json!(1_000_000);
        let bytes = serde_json::to_vec(&json).unwrap();
        let err = parse_manifest(&bytes).unwrap_err();
        assert!(matches!(err, DopplerError::InvalidManifest(_)));
    }

    #[test]
    fn classify_roles() {
        assert_eq!(classify_tensor_role("token_embedding"), Role::TokenEmbedding);
        assert_eq!(classify_tensor_role("block.3.attn.q"), Role::AttnQ(3));
        assert_eq!(classify_tensor_role("block.3.ffn.down"), Role::FfnDown(3));
        assert_eq!(classify_tensor_role("something_else"), Role::Aux);
    }

    #[test]
    fn round_trip_serialize() {
        let json = dummy_manifest_json(1);
        let bytes = serde_json::to_vec(&json).unwrap();
        let manifest = parse_manifest(&bytes).unwrap();
        let reserialized = serde_json::to_vec(&manifest).unwrap();
        let manifest2 = parse_manifest(&reserialized).unwrap();
        assert_eq!(manifest.model_id, manifest2.model_id);
        assert_eq!(manifest.tensors.len(), manifest2.tensors.len());
    }
}
