//! Progress events emitted during pipeline creation (spec §4.9, §6).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Manifest,
    Shards,
    Layers,
    GpuTransfer,
    Pipeline,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    /// Monotone within a stage (spec §4.9).
    pub progress: f32,
    pub message: Option<String>,
    pub bytes_loaded: Option<u64>,
    pub total_bytes: Option<u64>,
    pub bytes_per_second: Option<f64>,
}

impl ProgressEvent {
    pub fn new(stage: ProgressStage, progress: f32) -> Self {
        Self {
            stage,
            progress: progress.clamp(0.0, 1.0),
            message: None,
            bytes_loaded: None,
            total_bytes: None,
            bytes_per_second: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_bytes(mut self, loaded: u64, total: u64, bytes_per_second: f64) -> Self {
        self.bytes_loaded = Some(loaded);
        self.total_bytes = Some(total);
        self.bytes_per_second = Some(bytes_per_second);
        self
    }
}

/// Emits a [`ProgressEvent`] on an optional channel sender, swallowing
/// send failures — a consumer that has stopped listening does not abort
/// pipeline creation (mirrors `flume`'s typical fire-and-forget progress
/// channel usage elsewhere in the pack).
pub fn emit(sender: Option<&flume::Sender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(sender) = sender {
        let _ = sender.try_send(event);
    }
}
