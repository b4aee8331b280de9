//! Generator: async, cancellable token stream for one prompt (spec §4.10).
//!
//! Mirrors the teacher's inference loop shape (`ai00-core::run`'s batch
//! runner): a driving task pushes results onto an unbounded `flume`
//! channel while the caller drains the receiver as an async stream. Here
//! the "task" is the generator itself — `Generator::run` is driven to
//! completion by a single `tokio::spawn`, and the consumer polls the
//! returned receiver. Backpressure is implicit: the generator computes one
//! token, sends it, and only then computes the next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fastrand::Rng;
use uuid::Uuid;

use crate::error::{DopplerError, Result};
use crate::kernels::sampling::{argmax, sample, scale_by_temperature, softcap, softmax, top_k_mask, top_p_mask};
use crate::pipeline::Pipeline;
use crate::tokenizer::{ChatMessage, ChatTemplateKind, Tokenizer};

/// A cooperative cancellation signal: polled between decode steps and
/// before sampling, never interrupting an in-flight kernel dispatch (spec
/// §4.10, §5 "Cancellation semantics"). Cheap to clone and share with the
/// task driving a generation.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Eos,
    MaxTokens,
    Cancelled,
    ContextLength,
}

#[derive(Debug, Clone)]
pub struct GeneratedToken {
    pub id: u32,
    pub piece: String,
}

/// Wall-clock generation metrics (spec §4.10 "Metrics").
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationMetrics {
    pub ttft_ms: f64,
    pub prefill_tokens: usize,
    pub prefill_time_ms: f64,
    pub decode_tokens: usize,
    pub decode_time_ms: f64,
    pub total_time_ms: f64,
}

impl GenerationMetrics {
    pub fn tokens_per_sec(&self) -> f64 {
        if self.decode_time_ms <= 0.0 {
            0.0
        } else {
            self.decode_tokens as f64 / (self.decode_time_ms / 1000.0)
        }
    }
}

/// Identifies one `generate` call's session (spec §3 "Generation session"),
/// the same role `ai00-core`'s `StateId` plays for a loaded RNN state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub session_id: SessionId,
    pub finish_reason: FinishReason,
    pub metrics: GenerationMetrics,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub seed: Option<u64>,
    pub use_chat_template: bool,
    pub softcap: Option<f32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            seed: None,
            use_chat_template: false,
            softcap: None,
        }
    }
}

/// Monotonic counter seeding the process-local default RNG stream when the
/// caller supplies no `seed` (spec §9's open question: sampling must be
/// "implementation-chosen but stable within one generation" in that case —
/// each generation still gets its own reproducible seed, just not a
/// caller-controlled one).
static UNSEEDED_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

fn resolve_rng(seed: Option<u64>) -> Rng {
    match seed {
        Some(seed) => Rng::with_seed(seed),
        None => Rng::with_seed(UNSEEDED_COUNTER.fetch_add(1, Ordering::Relaxed)),
    }
}

/// Drives one `generate(prompt, options)` call to completion, streaming
/// [`GeneratedToken`]s on `sender` as they're produced (spec §4.10).
pub struct Generator<'a> {
    pipeline: &'a Pipeline,
    tokenizer: &'a dyn Tokenizer,
}

impl<'a> Generator<'a> {
    pub fn new(pipeline: &'a Pipeline, tokenizer: &'a dyn Tokenizer) -> Self {
        Self { pipeline, tokenizer }
    }

    /// Runs tokenize → prefill → decode loop, sending each token on
    /// `sender` as it's produced. Returns once generation stops, whether by
    /// EOS, `max_tokens`, cancellation, or hitting `max_context`.
    ///
    /// Acquires the pipeline's single-generation guard for its whole
    /// duration (spec §5) and always releases it, even on error.
    pub async fn run(
        &self,
        prompt: &str,
        options: GenerateOptions,
        cancel: CancellationToken,
        sender: flume::Sender<GeneratedToken>,
    ) -> Result<GenerationResult> {
        self.pipeline.begin_generation()?;
        let outcome = self.run_inner(prompt, options, cancel, sender).await;
        self.pipeline.end_generation();
        outcome
    }

    async fn run_inner(
        &self,
        prompt: &str,
        options: GenerateOptions,
        cancel: CancellationToken,
        sender: flume::Sender<GeneratedToken>,
    ) -> Result<GenerationResult> {
        let session_id = SessionId::new();
        let start = Instant::now();
        let mut rng = resolve_rng(options.seed);

        let prompt_text = if options.use_chat_template {
            self.tokenizer.apply_chat_template(
                &[ChatMessage {
                    role: "user".into(),
                    content: prompt.to_string(),
                }],
                ChatTemplateKind::Simple,
            )
        } else {
            prompt.to_string()
        };

        let mut ids = self.tokenizer.encode(&prompt_text);
        if ids.is_empty() {
            return Err(DopplerError::InvalidManifest("prompt encodes to zero tokens".into()));
        }

        let arch = &self.pipeline.manifest.architecture;
        let max_context = arch.max_context as usize;
        if ids.len() > max_context {
            return Err(DopplerError::CapacityExceeded(format!(
                "prompt length {} exceeds max_context {max_context}",
                ids.len()
            )));
        }

        // Prefill: one pass over the whole prompt, KV advances by |ids|.
        let prefill_start = Instant::now();
        let positions: Vec<usize> = (0..ids.len()).collect();
        let embedded = self.pipeline.embed(&ids)?;
        let hidden = self.pipeline.run_layers(embedded, &positions)?;
        let mut last_hidden = last_row(&hidden)?;
        let prefill_time_ms = prefill_start.elapsed().as_secs_f64() * 1000.0;
        let prefill_tokens = ids.len();

        let mut metrics = GenerationMetrics {
            ttft_ms: 0.0,
            prefill_tokens,
            prefill_time_ms,
            decode_tokens: 0,
            decode_time_ms: 0.0,
            total_time_ms: 0.0,
        };

        let eos_id = self.tokenizer.eos_id();
        let mut finish_reason = FinishReason::MaxTokens;
        let mut first_token_emitted = false;
        let decode_start = Instant::now();

        for step in 0..options.max_tokens {
            if cancel.is_cancelled() {
                finish_reason = FinishReason::Cancelled;
                break;
            }
            if self.pipeline.kv_cache().seq_len() >= max_context {
                match self.pipeline.config().on_context_exceeded {
                    crate::config::ContextPolicy::StopCleanly => {
                        finish_reason = FinishReason::ContextLength;
                        break;
                    }
                    crate::config::ContextPolicy::Fail => {
                        return Err(DopplerError::CapacityExceeded(format!(
                            "seqLen reached max_context {max_context}"
                        )));
                    }
                }
            }

            let mut logits = self.pipeline.logits(&last_hidden)?.data;
            if let Some(cap) = options.softcap {
                softcap(&mut logits, cap);
            }

            let next_id = if options.temperature == 0.0 {
                argmax(&logits) as u32
            } else {
                scale_by_temperature(&mut logits, options.temperature);
                top_k_mask(&mut logits, options.top_k as usize);
                let mut probs = softmax(&logits);
                top_p_mask(&mut probs, options.top_p);
                sample(&probs, &mut rng) as u32
            };

            if cancel.is_cancelled() {
                finish_reason = FinishReason::Cancelled;
                break;
            }

            let position = ids.len();
            ids.push(next_id);
            metrics.decode_tokens += 1;
            if !first_token_emitted {
                metrics.ttft_ms = start.elapsed().as_secs_f64() * 1000.0;
                first_token_emitted = true;
            }

            let piece = self.tokenizer.decode_piece(next_id);
            // `send_async` awaits until the consumer has capacity, the
            // backpressure spec §9 describes ("consumer awaits the next
            // token before the generator proceeds") — with an unbounded
            // channel this resolves immediately, same as a sync `send`.
            if sender.send_async(GeneratedToken { id: next_id, piece }).await.is_err() {
                // Consumer dropped the receiver; treat like cancellation so
                // the loop still leaves KV in a consistent state.
                finish_reason = FinishReason::Cancelled;
                break;
            }

            if Some(next_id) == eos_id {
                finish_reason = FinishReason::Eos;
                break;
            }
            if step + 1 == options.max_tokens {
                finish_reason = FinishReason::MaxTokens;
                break;
            }

            let embedded = self.pipeline.embed(&[next_id])?;
            let hidden = self.pipeline.run_layers(embedded, &[position])?;
            last_hidden = last_row(&hidden)?;
        }

        metrics.decode_time_ms = decode_start.elapsed().as_secs_f64() * 1000.0;
        metrics.total_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        tracing::info!(
            event = "generation_finished",
            session_id = %session_id,
            finish_reason = ?finish_reason,
            decode_tokens = metrics.decode_tokens,
            tokens_per_sec = metrics.tokens_per_sec(),
            "Generation finished"
        );

        Ok(GenerationResult {
            session_id,
            finish_reason,
            metrics,
        })
    }
}

fn last_row(x: &crate::kernels::Tensor) -> Result<crate::kernels::Tensor> {
    let width = x.cols();
    let rows = x.rows();
    crate::kernels::Tensor::new(vec![1, width], x.data[(rows - 1) * width..rows * width].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::config::RuntimeConfig;
    use crate::device::Device;
    use crate::manifest::{
        ActivationKind, Architecture, AttentionKind, Dtype, InferencePlan, Manifest, ModelType,
        QuantizationPolicy, Role, ShardDescriptor, TensorDescriptor, TokenizerRef,
    };
    use crate::shard_store::{KeyValueBackend, ModelStore, StoragePreference};
    use crate::tokenizer::ReferenceByteTokenizer;
    use std::collections::BTreeMap;
    use std::sync::Arc as StdArc;

    async fn build_test_pipeline(max_context: u32) -> Pipeline {
        let hidden = 4usize;
        let mut tensors = BTreeMap::new();
        let mut data = Vec::new();
        let mut push_identity = |name: &str, role: Role, tensors: &mut BTreeMap<String, TensorDescriptor>, data: &mut Vec<u8>| {
            let mut m = vec![0.0f32; hidden * hidden];
            for i in 0..hidden {
                m[i * hidden + i] = 1.0;
            }
            let bytes: Vec<u8> = m.iter().flat_map(|v| v.to_le_bytes()).collect();
            let offset = data.len() as u64;
            let len = bytes.len() as u64;
            data.extend_from_slice(&bytes);
            tensors.insert(
                name.to_string(),
                TensorDescriptor {
                    shard_index: 0,
                    byte_offset: offset,
                    byte_length: len,
                    dtype: Dtype::F32,
                    shape: vec![hidden as u32, hidden as u32],
                    role,
                },
            );
        };
        let mut push_vector = |name: &str, role: Role, tensors: &mut BTreeMap<String, TensorDescriptor>, data: &mut Vec<u8>| {
            let v = vec![1.0f32; hidden];
            let bytes: Vec<u8> = v.iter().flat_map(|x| x.to_le_bytes()).collect();
            let offset = data.len() as u64;
            let len = bytes.len() as u64;
            data.extend_from_slice(&bytes);
            tensors.insert(
                name.to_string(),
                TensorDescriptor {
                    shard_index: 0,
                    byte_offset: offset,
                    byte_length: len,
                    dtype: Dtype::F32,
                    shape: vec![hidden as u32],
                    role,
                },
            );
        };

        push_identity("tok_emb", Role::TokenEmbedding, &mut tensors, &mut data);
        push_identity("lm_head", Role::OutputEmbedding, &mut tensors, &mut data);
        push_vector("final_norm", Role::FinalNorm, &mut tensors, &mut data);
        push_vector("an0", Role::AttnNorm(0), &mut tensors, &mut data);
        push_vector("fn0", Role::FfnNorm(0), &mut tensors, &mut data);
        push_identity("q0", Role::AttnQ(0), &mut tensors, &mut data);
        push_identity("k0", Role::AttnK(0), &mut tensors, &mut data);
        push_identity("v0", Role::AttnV(0), &mut tensors, &mut data);
        push_identity("o0", Role::AttnO(0), &mut tensors, &mut data);
        push_identity("g0", Role::FfnGate(0), &mut tensors, &mut data);
        push_identity("u0", Role::FfnUp(0), &mut tensors, &mut data);
        push_identity("d0", Role::FfnDown(0), &mut tensors, &mut data);

        let mut hasher = sha2::Sha256::new();
        sha2::Digest::update(&mut hasher, &data);
        let shard_hash = crate::shard_store::hex_encode(&sha2::Digest::finalize(hasher));

        let manifest = Manifest {
            model_id: "test".into(),
            model_type: ModelType::Transformer,
            architecture: Architecture {
                hidden_dim: hidden as u32,
                num_layers: 1,
                num_heads: 1,
                num_kv_heads: 1,
                head_dim: hidden as u32,
                ffn_dim: hidden as u32,
                vocab: hidden as u32,
                max_context,
                rope_base: 10000.0,
                norm_eps: 1e-5,
                activation: ActivationKind::Relu,
                attention_kind: AttentionKind::Full,
                softcap: None,
            },
            quantization: QuantizationPolicy { weights: Dtype::F32, embeddings: Dtype::F32 },
            shards: vec![ShardDescriptor {
                index: 0,
                filename: "shard_00000.bin".into(),
                offset: 0,
                size: data.len() as u64,
                sha256: shard_hash,
            }],
            tensors,
            tokenizer: TokenizerRef { path: "tokenizer.json".into(), model_path: None },
            inference: InferencePlan::default(),
        };
        let kv = StdArc::new(KeyValueBackend::new());
        let store = ModelStore::open("test", StoragePreference::KeyValue, None, Some(kv)).unwrap();
        store.write_shard(0, &data).await.unwrap();

        let device = StdArc::new(Device::new_cpu());
        let pool: crate::buffer_pool::SharedBufferPool = StdArc::new(BufferPool::new(u64::MAX, u64::MAX, 0));
        Pipeline::create(manifest, &store, device, pool, RuntimeConfig::default(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn greedy_generation_stops_at_max_tokens_and_advances_kv() {
        let pipeline = build_test_pipeline(64).await;
        let tokenizer = ReferenceByteTokenizer;
        let generator = Generator::new(&pipeline, &tokenizer);
        let options = GenerateOptions {
            max_tokens: 5,
            temperature: 0.0,
            ..Default::default()
        };
        let (tx, rx) = flume::unbounded();
        let result = generator.run("hi", options, CancellationToken::new(), tx).await.unwrap();
        let tokens: Vec<_> = rx.drain().collect();
        assert_eq!(tokens.len(), 5);
        assert_eq!(result.finish_reason, FinishReason::MaxTokens);
        assert_eq!(result.metrics.decode_tokens, 5);
        assert_eq!(pipeline.kv_cache().seq_len(), 2 + 5);
    }

    #[tokio::test]
    async fn cancellation_before_run_stops_immediately_and_leaves_kv_consistent() {
        let pipeline = build_test_pipeline(64).await;
        let tokenizer = ReferenceByteTokenizer;
        let generator = Generator::new(&pipeline, &tokenizer);
        let options = GenerateOptions {
            max_tokens: 1000,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, rx) = flume::unbounded();
        let result = generator.run("hi", options, cancel, tx).await.unwrap();
        let tokens: Vec<_> = rx.drain().collect();
        assert!(tokens.is_empty());
        assert_eq!(result.finish_reason, FinishReason::Cancelled);
        assert_eq!(pipeline.kv_cache().seq_len(), 2);
    }

    #[tokio::test]
    async fn single_generation_guard_rejects_concurrent_run() {
        let pipeline = build_test_pipeline(64).await;
        pipeline.begin_generation().unwrap();
        let tokenizer = ReferenceByteTokenizer;
        let generator = Generator::new(&pipeline, &tokenizer);
        let (tx, _rx) = flume::unbounded();
        let err = generator
            .run("hi", GenerateOptions::default(), CancellationToken::new(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, DopplerError::AlreadyGenerating));
        pipeline.end_generation();
    }

    #[tokio::test]
    async fn context_length_stops_decode_once_seq_len_hits_max_context() {
        let pipeline = build_test_pipeline(3).await;
        let tokenizer = ReferenceByteTokenizer;
        let generator = Generator::new(&pipeline, &tokenizer);
        let options = GenerateOptions {
            max_tokens: 1000,
            temperature: 0.0,
            ..Default::default()
        };
        let (tx, rx) = flume::unbounded();
        let result = generator.run("h", options, CancellationToken::new(), tx).await.unwrap();
        let tokens: Vec<_> = rx.drain().collect();
        assert_eq!(result.finish_reason, FinishReason::ContextLength);
        assert_eq!(pipeline.kv_cache().seq_len(), 3);
        assert_eq!(tokens.len(), 2);
    }
}
