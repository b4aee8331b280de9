//! Runtime configuration (spec §6 "Runtime configuration").
//!
//! `RuntimeConfig` is deserialized once by the caller and handed to
//! [`crate::pipeline::Pipeline::create`], which freezes it for the
//! pipeline's lifetime — mirroring the teacher's `ReloadRequest` being
//! consumed once into an `Arc<RuntimeInfo>` snapshot held by the running
//! environment (spec §1 ambient-stack note, SPEC_FULL.md §1). Mutating a
//! caller's `RuntimeConfig` value after `create` has no effect on the
//! running pipeline.

use serde::{Deserialize, Serialize};

use crate::manifest::InferencePlan;
use crate::shard_store::StoragePreference as StorageBackendPreference;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    pub max_tokens: u32,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self { max_tokens: 256 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatTemplateConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub sampling: SamplingConfig,
    pub batching: BatchingConfig,
    pub chat_template: ChatTemplateConfig,
    /// Per-layer step order override (spec §6's `inference.pipeline`). When
    /// absent, each layer runs the manifest's own `InferencePlan`.
    pub pipeline: Option<InferencePlan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePreferenceConfig {
    Directory,
    KeyValue,
    Auto,
}

impl From<StoragePreferenceConfig> for StorageBackendPreference {
    fn from(value: StoragePreferenceConfig) -> Self {
        match value {
            StoragePreferenceConfig::Directory => StorageBackendPreference::Directory,
            StoragePreferenceConfig::KeyValue => StorageBackendPreference::KeyValue,
            StoragePreferenceConfig::Auto => StorageBackendPreference::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub preference: StoragePreferenceConfig,
    pub root_name: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            preference: StoragePreferenceConfig::Auto,
            root_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingConfig {
    pub storage: StorageConfig,
}

/// Gates diagnostics/benchmark entry points (spec §6, §7 `IntentRequired`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Verify,
    Investigate,
    Calibrate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolingConfig {
    pub intent: Option<Intent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    pub tooling: ToolingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugProbe {
    pub tensor_name: String,
    pub token: Option<u32>,
    pub indices: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub probes: Vec<DebugProbe>,
}

/// Resolves spec.md §9's open question on `max_context` overflow: decode
/// that would exceed `max_context` either stops the stream cleanly
/// (`FinishReason::ContextLength`, the default) or fails with
/// `CapacityExceeded`, per pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPolicy {
    StopCleanly,
    Fail,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        ContextPolicy::StopCleanly
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub inference: InferenceConfig,
    pub loading: LoadingConfig,
    pub shared: SharedConfig,
    pub debug: DebugConfig,
    pub on_context_exceeded: ContextPolicy,
}
