//! Pipeline: model-level orchestrator (spec §4.9).
//!
//! Owns the manifest, every resident weight buffer (keyed by role), the
//! per-layer KV cache, and the runtime knobs frozen in at `create` time.
//! `create` only returns once every weight and every KV buffer is
//! resident, per spec §4.9 step (v).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer_pool::{Buffer, BufferPoolStats, SharedBufferPool};
use crate::config::RuntimeConfig;
use crate::device::{Device, DeviceState};
use crate::error::{DopplerError, Result};
use crate::heap_manager::{Category, HeapManager, HeapSnapshot};
use crate::kernels::gather::gather;
use crate::kernels::matmul::{dequantize, matmul};
use crate::kernels::rmsnorm::rmsnorm;
use crate::kernels::Tensor;
use crate::kv_cache::{KvCache, KvCacheStats};
use crate::layer_engine::{execute_layer, LayerWeights};
use crate::manifest::{Manifest, Role, TensorResolver};
use crate::progress::{emit, ProgressEvent, ProgressStage};
use crate::shard_store::{hex_encode, ModelStore};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub pool: BufferPoolStats,
    pub heap: HeapSnapshot,
}

#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub memory: MemoryStats,
    pub kv: KvCacheStats,
    pub device_state: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Active,
    Unloaded,
}

struct ResidentWeights {
    token_embedding: Tensor,
    output_embedding: Tensor,
    final_norm: Tensor,
    layers: Vec<LayerWeights>,
}

/// Model-level orchestrator (spec §4.9). `generate` lives in
/// [`crate::generator`], which borrows a pipeline for the lifetime of one
/// generation and enforces the single-generation invariant via
/// [`Pipeline::begin_generation`]/[`Pipeline::end_generation`].
pub struct Pipeline {
    pub manifest: Manifest,
    device: Arc<Device>,
    buffer_pool: SharedBufferPool,
    heap: HeapManager,
    kv_cache: KvCache,
    weights: ResidentWeights,
    weight_buffers: Vec<Buffer>,
    kv_buffers: Vec<Buffer>,
    config: RuntimeConfig,
    state: Mutex<PipelineState>,
    generating: AtomicBool,
}

impl Pipeline {
    /// Builds the pipeline: streams every required tensor from its shard,
    /// decodes it, tracks it through the buffer pool and heap manager, and
    /// initializes the KV cache. Emits [`ProgressEvent`]s at the
    /// checkpoints spec §4.9 names.
    pub async fn create(
        manifest: Manifest,
        store: &ModelStore,
        device: Arc<Device>,
        buffer_pool: SharedBufferPool,
        config: RuntimeConfig,
        progress: Option<&flume::Sender<ProgressEvent>>,
    ) -> Result<Self> {
        device.ensure_active()?;
        emit(progress, ProgressEvent::new(ProgressStage::Manifest, 1.0).with_message("manifest parsed"));

        let heap = HeapManager::new(None);
        let arch = &manifest.architecture;

        let mut shard_cache: HashMap<u32, Vec<u8>> = HashMap::new();

        emit(progress, ProgressEvent::new(ProgressStage::Shards, 0.0));
        let total_shards = manifest.shards.len().max(1);
        for (i, shard) in manifest.shards.iter().enumerate() {
            let bytes = store.read_shard(shard.index).await?;
            // `ModelStore::verify_integrity` is the explicit, opt-in full-package
            // check (spec §4.1: not run implicitly on hot paths); `create` is a
            // one-time cold path that already pays the cost of reading every
            // shard's bytes into memory, so checking each one's hash here is
            // free relative to the I/O it already did.
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let digest = hex_encode(&hasher.finalize());
            if digest != shard.sha256 {
                return Err(DopplerError::Corrupt(format!(
                    "shard {} failed integrity check",
                    shard.index
                )));
            }
            shard_cache.insert(shard.index, bytes);
            emit(
                progress,
                ProgressEvent::new(ProgressStage::Shards, (i + 1) as f32 / total_shards as f32),
            );
        }

        emit(progress, ProgressEvent::new(ProgressStage::Layers, 0.0));
        let (weights, weight_buffers) =
            load_resident_weights(&manifest, &shard_cache, &buffer_pool, &heap, progress)?;

        emit(progress, ProgressEvent::new(ProgressStage::GpuTransfer, 1.0).with_message("weights resident"));

        let mut kv_buffers = Vec::new();
        let per_layer_bytes = arch.max_context as u64 * arch.num_kv_heads as u64 * arch.head_dim as u64 * 4;
        for _ in 0..arch.num_layers {
            let k_buf = buffer_pool.acquire(per_layer_bytes, "kv_cache:k")?;
            let v_buf = buffer_pool.acquire(per_layer_bytes, "kv_cache:v")?;
            heap.register(&k_buf, Category::KvCache);
            heap.register(&v_buf, Category::KvCache);
            kv_buffers.push(k_buf);
            kv_buffers.push(v_buf);
        }
        let kv_cache = KvCache::new(
            arch.num_layers as usize,
            arch.max_context as usize,
            arch.num_kv_heads as usize,
            arch.head_dim as usize,
        );

        emit(progress, ProgressEvent::new(ProgressStage::Pipeline, 1.0));

        tracing::info!(
            event = "pipeline_created",
            model_id = %manifest.model_id,
            num_layers = arch.num_layers,
            "Pipeline resident and ready"
        );
        emit(progress, ProgressEvent::new(ProgressStage::Complete, 1.0));

        Ok(Self {
            manifest,
            device,
            buffer_pool,
            heap,
            kv_cache,
            weights,
            weight_buffers,
            kv_buffers,
            config,
            state: Mutex::new(PipelineState::Active),
            generating: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn ensure_active(&self) -> Result<()> {
        self.device.ensure_active()?;
        let state = *self.state.lock().expect("pipeline state mutex poisoned");
        if state == PipelineState::Unloaded {
            return Err(DopplerError::NotFound("pipeline has been unloaded".into()));
        }
        Ok(())
    }

    /// Marks a generation as active; fails with `AlreadyGenerating` if one
    /// is already running (spec §5's single-generation invariant).
    pub fn begin_generation(&self) -> Result<()> {
        self.ensure_active()?;
        if self.generating.swap(true, Ordering::SeqCst) {
            return Err(DopplerError::AlreadyGenerating);
        }
        Ok(())
    }

    pub fn end_generation(&self) {
        self.generating.store(false, Ordering::SeqCst);
    }

    pub fn embed(&self, ids: &[u32]) -> Result<Tensor> {
        gather(&self.weights.token_embedding, ids)
    }

    /// Runs every decoder layer in order over `x`, appending to KV at
    /// `positions`.
    pub fn run_layers(&self, mut x: Tensor, positions: &[usize]) -> Result<Tensor> {
        let plan = self
            .config
            .inference
            .pipeline
            .as_ref()
            .unwrap_or(&self.manifest.inference);
        let new_tokens = x.rows();
        for (i, layer) in self.weights.layers.iter().enumerate() {
            x = execute_layer(i, &x, layer, &self.kv_cache, &self.manifest.architecture, positions, plan)?;
        }
        // Commit once per step, after every layer's append has succeeded —
        // advancing `seqLen` once per layer would overcount it by
        // `num_layers` and shift later layers' append offsets (spec §4.7:
        // `seqLen` is a single counter shared across all layers).
        self.kv_cache.commit(new_tokens)?;
        Ok(x)
    }

    /// `final_norm -> logits = X · output_embeddingᵀ`.
    pub fn logits(&self, x: &Tensor) -> Result<Tensor> {
        let normed = rmsnorm(x, &self.weights.final_norm, self.manifest.architecture.norm_eps)?;
        matmul(&normed, &self.weights.output_embedding, true)
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv_cache
    }

    pub fn clear_kv_cache(&self) {
        self.kv_cache.reset();
    }

    pub fn get_memory_stats(&self) -> MemoryStats {
        MemoryStats {
            pool: self.buffer_pool.get_stats(),
            heap: self.heap.snapshot(),
        }
    }

    pub fn get_kv_cache_stats(&self) -> KvCacheStats {
        self.kv_cache.stats()
    }

    pub fn get_stats(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            memory: self.get_memory_stats(),
            kv: self.get_kv_cache_stats(),
            device_state: self.device.state(),
        }
    }

    /// Releases every tracked buffer in deterministic order — KV first,
    /// weights last (spec §4.9) — and transitions to a terminal state
    /// that rejects further calls.
    pub fn unload(mut self) {
        for buffer in self.kv_buffers.drain(..) {
            self.heap.unregister(&buffer);
            self.buffer_pool.release(buffer);
        }
        for buffer in self.weight_buffers.drain(..) {
            self.heap.unregister(&buffer);
            self.buffer_pool.release(buffer);
        }
        *self.state.lock().expect("pipeline state mutex poisoned") = PipelineState::Unloaded;
        tracing::info!(event = "pipeline_unloaded", model_id = %self.manifest.model_id, "Pipeline unloaded");
    }
}

/// Resolves and dequantizes every weight tensor the manifest's inference
/// plan requires, tracking each one through the buffer pool and heap
/// manager. On any failure partway through, every buffer already acquired
/// in this call is released back to the pool before the error propagates —
/// spec §7's "the buffer pool leaves no orphaned buffers after any error".
fn load_resident_weights(
    manifest: &Manifest,
    shard_cache: &HashMap<u32, Vec<u8>>,
    buffer_pool: &SharedBufferPool,
    heap: &HeapManager,
    progress: Option<&flume::Sender<ProgressEvent>>,
) -> Result<(ResidentWeights, Vec<Buffer>)> {
    let resolver = TensorResolver::new(manifest);
    let arch = &manifest.architecture;
    let mut weight_buffers = Vec::new();

    let result = (|| -> Result<ResidentWeights> {
        let mut resolve_tensor = |role: Role| -> Result<Tensor> {
            let (name, tensor) = resolver
                .resolve_role(role)
                .ok_or_else(|| DopplerError::InvalidManifest(format!("no tensor with role {role:?}")))?;
            let shard_bytes = shard_cache.get(&tensor.shard_index).ok_or_else(|| {
                DopplerError::NotFound(format!("shard {} referenced by tensor {name}", tensor.shard_index))
            })?;
            let start = tensor.byte_offset as usize;
            let end = start + tensor.byte_length as usize;
            let raw = shard_bytes.get(start..end).ok_or_else(|| {
                DopplerError::InvalidManifest(format!("tensor {name} byte range out of bounds"))
            })?;

            let buffer = buffer_pool.acquire(tensor.byte_length, &format!("weight:{role:?}"))?;
            buffer_pool.write(&buffer, raw)?;
            buffer_pool.set_dtype(&buffer, tensor.dtype);
            heap.register(&buffer, Category::Weights);
            weight_buffers.push(buffer);

            let shape: Vec<usize> = tensor.shape.iter().map(|&d| d as usize).collect();
            dequantize(tensor.dtype, shape, raw)
        };

        let token_embedding = resolve_tensor(Role::TokenEmbedding)?;
        let output_embedding = resolve_tensor(Role::OutputEmbedding)?;
        let final_norm = resolve_tensor(Role::FinalNorm)?;

        let mut layers = Vec::with_capacity(arch.num_layers as usize);
        for i in 0..arch.num_layers {
            let attn_norm = resolve_tensor(Role::AttnNorm(i))?;
            let ffn_norm = resolve_tensor(Role::FfnNorm(i))?;
            let w_q = resolve_tensor(Role::AttnQ(i))?;
            let w_k = resolve_tensor(Role::AttnK(i))?;
            let w_v = resolve_tensor(Role::AttnV(i))?;
            let w_o = resolve_tensor(Role::AttnO(i))?;
            let w_gate = resolve_tensor(Role::FfnGate(i))?;
            let w_up = resolve_tensor(Role::FfnUp(i))?;
            let w_down = resolve_tensor(Role::FfnDown(i))?;
            layers.push(LayerWeights {
                attn_norm,
                ffn_norm,
                w_q,
                w_k,
                w_v,
                w_o,
                w_gate,
                w_up,
                w_down,
            });
            emit(
                progress,
                ProgressEvent::new(ProgressStage::Layers, (i + 1) as f32 / arch.num_layers as f32),
            );
        }

        Ok(ResidentWeights {
            token_embedding,
            output_embedding,
            final_norm,
            layers,
        })
    })();

    match result {
        Ok(weights) => Ok((weights, weight_buffers)),
        Err(e) => {
            for buffer in weight_buffers.drain(..) {
                heap.unregister(&buffer);
                buffer_pool.release(buffer);
            }
            Err(e)
        }
    }
}
