//! `doppler-core`: the inference execution core for an in-browser,
//! WebGPU-class-accelerator LLM runtime.
//!
//! This crate owns the pieces where the real engineering lives — binary
//! shard decoding, GPU resource lifetime, quantized matmul ordering,
//! per-layer scheduling, attention with sliding-window/GQA variants, KV
//! reuse across tokens, backpressure into a single GPU queue, and
//! cancellable streaming generation. UI panels, catalog browsers, and CLI
//! wrapping are callers of this crate, not part of it.
//!
//! Dependency order, leaves first: [`manifest`] and [`shard_store`] have
//! no internal dependencies; [`device`], [`buffer_pool`], and
//! [`heap_manager`] depend only on the accelerator abstraction;
//! [`kernels`] depends on `device`/`buffer_pool`; [`kv_cache`] depends on
//! `buffer_pool`; [`layer_engine`] composes kernels and the KV cache;
//! [`pipeline`] composes layers; [`generator`] owns a pipeline and a
//! [`tokenizer::Tokenizer`].

pub mod buffer_pool;
pub mod config;
pub mod device;
pub mod error;
pub mod generator;
pub mod heap_manager;
pub mod kernels;
pub mod kv_cache;
pub mod layer_engine;
pub mod manifest;
pub mod pipeline;
pub mod progress;
pub mod shard_store;
pub mod tokenizer;

pub use config::RuntimeConfig;
pub use device::Device;
pub use error::{DopplerError, Result};
pub use generator::{CancellationToken, GenerateOptions, GeneratedToken, GenerationResult, Generator};
pub use manifest::{parse_manifest, Manifest};
pub use pipeline::Pipeline;
pub use progress::{ProgressEvent, ProgressStage};
pub use shard_store::ModelStore;
pub use tokenizer::Tokenizer;
