//! Tagged error variants surfaced by the inference core (spec §7).
//!
//! Every variant carries a human-readable message and nothing else —
//! in particular, no partially-constructed buffers, tensors, or other
//! executable state ever rides along inside an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DopplerError {
    /// Missing shard, missing tensor, or unknown model id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Manifest failed schema validation.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A shard's bytes do not match its declared hash.
    #[error("corrupt shard: {0}")]
    Corrupt(String),

    /// The manifest requests a dtype this build does not implement.
    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// The manifest requests a model family/architecture this build does not implement.
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// A kernel's input shapes are inconsistent with each other or its output.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The KV cache is full, or the buffer pool cannot satisfy an allocation
    /// within the device's memory limit.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The accelerator reported device loss; the owning pipeline is terminal.
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// A write to persistent storage would exceed its quota.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A `generate` call was made while another was already active on the
    /// same pipeline (spec §5's single-generation invariant).
    #[error("a generation is already in progress on this pipeline")]
    AlreadyGenerating,

    /// The caller cancelled generation. Any tokens already streamed remain
    /// valid; this is reported, not treated as a hard failure.
    #[error("generation aborted")]
    Aborted,

    /// A diagnostics/benchmark entry point was invoked without the required
    /// `shared.tooling.intent` configuration (spec §6, §7).
    #[error("intent required: {0}")]
    IntentRequired(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DopplerError>;
