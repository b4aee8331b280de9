//! Shard Store: content-addressed storage of manifest + fixed-size binary
//! shards, with integrity verification (spec §4.1).
//!
//! Two backend variants are required by spec: a directory-style object
//! store (hierarchical, streamable) and a key-value store (flat,
//! blob-valued). `open` picks between them at a fixed preference order and
//! records which one it used, mirroring `ai00-core`'s own backend-dispatch
//! pattern in `process()` (`Backend::WebGpu` vs `Backend::Hip`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{DopplerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Directory,
    KeyValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePreference {
    Directory,
    KeyValue,
    Auto,
}

#[derive(Debug, Default, Clone)]
pub struct IntegrityReport {
    pub missing_shards: Vec<u32>,
    pub corrupt_shards: Vec<u32>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing_shards.is_empty() && self.corrupt_shards.is_empty()
    }
}

/// Capability set a backend may implement. Every backend here implements
/// all four; the trait exists so future backends can implement a subset
/// (e.g. a read-only CDN-backed store) without breaking the facade.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn list_models(&self) -> Result<Vec<String>>;
    async fn read_manifest(&self, model_id: &str) -> Result<Option<Vec<u8>>>;
    async fn read_shard(&self, model_id: &str, index: u32) -> Result<Vec<u8>>;
    async fn write_shard(&self, model_id: &str, index: u32, bytes: &[u8]) -> Result<()>;
    async fn delete(&self, model_id: &str) -> Result<()>;
    fn kind(&self) -> BackendKind;
}

/// A hierarchical, streamable backend: one directory per model, one file
/// per shard, named `shard_{index:05}.bin`.
pub struct DirectoryBackend {
    root: PathBuf,
    quota_bytes: Option<u64>,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: None,
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    fn shard_path(&self, model_id: &str, index: u32) -> PathBuf {
        self.model_dir(model_id).join(format!("shard_{index:05}.bin"))
    }

    fn manifest_path(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join("manifest.json")
    }

    async fn dir_size(&self, model_id: &str) -> Result<u64> {
        let dir = self.model_dir(model_id);
        let mut total = 0u64;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

#[async_trait::async_trait]
impl StorageBackend for DirectoryBackend {
    async fn list_models(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn read_manifest(&self, model_id: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.manifest_path(model_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Memory-maps the shard file rather than reading it into a `Vec` up
    /// front — shards can run tens of megabytes, and a weight buffer only
    /// ever needs the tensor ranges the manifest points into (mirrors the
    /// teacher's `File::open(..).await?` + `Mmap::map` pattern used to load
    /// model weight files without copying them first).
    async fn read_shard(&self, model_id: &str, index: u32) -> Result<Vec<u8>> {
        let file = fs::File::open(self.shard_path(model_id, index))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    DopplerError::NotFound(format!("shard {index} of {model_id}"))
                }
                _ => DopplerError::Io(e),
            })?;
        let mmap = unsafe { Mmap::map(&file) }?;
        Ok(mmap.to_vec())
    }

    async fn write_shard(&self, model_id: &str, index: u32, bytes: &[u8]) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            let current = self.dir_size(model_id).await?;
            if current + bytes.len() as u64 > quota {
                return Err(DopplerError::QuotaExceeded(format!(
                    "writing shard {index} would exceed quota of {quota} bytes"
                )));
            }
        }
        let dir = self.model_dir(model_id);
        fs::create_dir_all(&dir).await?;
        fs::write(self.shard_path(model_id, index), bytes).await?;
        Ok(())
    }

    async fn delete(&self, model_id: &str) -> Result<()> {
        let dir = self.model_dir(model_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Directory
    }
}

/// A flat, blob-valued backend — e.g. an in-memory or embedded KV store.
/// Manifest and shard bytes are stored under synthetic keys.
#[derive(Default)]
pub struct KeyValueBackend {
    store: Mutex<HashMap<String, Vec<u8>>>,
    quota_bytes: Option<u64>,
}

impl KeyValueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn manifest_key(model_id: &str) -> String {
        format!("{model_id}::manifest")
    }

    fn shard_key(model_id: &str, index: u32) -> String {
        format!("{model_id}::shard::{index}")
    }
}

#[async_trait::async_trait]
impl StorageBackend for KeyValueBackend {
    async fn list_models(&self) -> Result<Vec<String>> {
        let store = self.store.lock().await;
        let mut ids: Vec<String> = store
            .keys()
            .filter_map(|k| k.split("::manifest").next())
            .filter(|_| true)
            .filter(|k| store.contains_key(&format!("{k}::manifest")))
            .map(|k| k.to_string())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn read_manifest(&self, model_id: &str) -> Result<Option<Vec<u8>>> {
        let store = self.store.lock().await;
        Ok(store.get(&Self::manifest_key(model_id)).cloned())
    }

    async fn read_shard(&self, model_id: &str, index: u32) -> Result<Vec<u8>> {
        let store = self.store.lock().await;
        store
            .get(&Self::shard_key(model_id, index))
            .cloned()
            .ok_or_else(|| DopplerError::NotFound(format!("shard {index} of {model_id}")))
    }

    async fn write_shard(&self, model_id: &str, index: u32, bytes: &[u8]) -> Result<()> {
        let mut store = self.store.lock().await;
        if let Some(quota) = self.quota_bytes {
            let current: u64 = store
                .iter()
                .filter(|(k, _)| k.starts_with(&format!("{model_id}::")))
                .map(|(_, v)| v.len() as u64)
                .sum();
            if current + bytes.len() as u64 > quota {
                return Err(DopplerError::QuotaExceeded(format!(
                    "writing shard {index} would exceed quota of {quota} bytes"
                )));
            }
        }
        store.insert(Self::shard_key(model_id, index), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, model_id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        store.retain(|k, _| !k.starts_with(&format!("{model_id}::")));
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::KeyValue
    }
}

/// Picks a backend at `open` time per a fixed preference order, and wraps
/// it with the `(modelId, shardIndex) -> bytes` facade (spec §4.1, §6
/// "Storage facade").
pub struct ModelStore {
    backend: Arc<dyn StorageBackend>,
    model_id: String,
}

impl ModelStore {
    /// Chooses a backend for `preference`: an explicit choice is honored if
    /// supplied; `Auto` prefers the directory-style backend when `root` is
    /// given, falling back to the key-value backend otherwise.
    pub fn open(
        model_id: impl Into<String>,
        preference: StoragePreference,
        directory_root: Option<&Path>,
        key_value: Option<Arc<KeyValueBackend>>,
    ) -> Result<Self> {
        let model_id = model_id.into();
        let backend: Arc<dyn StorageBackend> = match preference {
            StoragePreference::Directory => {
                let root = directory_root
                    .ok_or_else(|| DopplerError::NotFound("no directory root configured".into()))?;
                Arc::new(DirectoryBackend::new(root))
            }
            StoragePreference::KeyValue => {
                key_value.unwrap_or_else(|| Arc::new(KeyValueBackend::new()))
            }
            StoragePreference::Auto => {
                if let Some(root) = directory_root {
                    Arc::new(DirectoryBackend::new(root))
                } else {
                    key_value.unwrap_or_else(|| Arc::new(KeyValueBackend::new()))
                }
            }
        };
        tracing::info!(
            event = "store_opened",
            model_id = %model_id,
            backend = ?backend.kind(),
            "Shard store opened"
        );
        Ok(Self { backend, model_id })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn read_manifest(&self) -> Result<Option<Vec<u8>>> {
        self.backend.read_manifest(&self.model_id).await
    }

    pub async fn read_shard(&self, index: u32) -> Result<Vec<u8>> {
        self.backend.read_shard(&self.model_id, index).await
    }

    pub async fn write_shard(&self, index: u32, bytes: &[u8]) -> Result<()> {
        self.backend.write_shard(&self.model_id, index, bytes).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.backend.delete(&self.model_id).await
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        self.backend.list_models().await
    }

    /// Hashes each shard with SHA-256 and compares against the manifest's
    /// declared hash. Not called implicitly by any load path (spec §4.1:
    /// "cost-prohibitive on hot paths").
    pub async fn verify_integrity(
        &self,
        manifest: &crate::manifest::Manifest,
    ) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        for shard in &manifest.shards {
            match self.backend.read_shard(&self.model_id, shard.index).await {
                Ok(bytes) => {
                    let mut hasher = Sha256::new();
                    hasher.update(&bytes);
                    let digest = hasher.finalize();
                    let hex = hex_encode(&digest);
                    if hex != shard.sha256 {
                        report.corrupt_shards.push(shard.index);
                    }
                }
                Err(DopplerError::NotFound(_)) => report.missing_shards.push(shard.index),
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(&mut s, "{b:02x}").expect("writing to a String cannot fail");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ModelType, QuantizationPolicy, TokenizerRef};
    use std::collections::BTreeMap;

    fn dummy_manifest(shards: Vec<crate::manifest::ShardDescriptor>) -> crate::manifest::Manifest {
        crate::manifest::Manifest {
            model_id: "dummy".into(),
            model_type: ModelType::Transformer,
            architecture: crate::manifest::Architecture {
                hidden_dim: 8,
                num_layers: 1,
                num_heads: 1,
                num_kv_heads: 1,
                head_dim: 8,
                ffn_dim: 8,
                vocab: 16,
                max_context: 32,
                rope_base: 10000.0,
                norm_eps: 1e-5,
                activation: crate::manifest::ActivationKind::Silu,
                attention_kind: crate::manifest::AttentionKind::Full,
                softcap: None,
            },
            quantization: QuantizationPolicy {
                weights: crate::manifest::Dtype::F32,
                embeddings: crate::manifest::Dtype::F32,
            },
            shards,
            tensors: BTreeMap::new(),
            tokenizer: TokenizerRef {
                path: "tokenizer.json".into(),
                model_path: None,
            },
            inference: crate::manifest::InferencePlan::default(),
        }
    }

    #[tokio::test]
    async fn key_value_round_trip() {
        let kv = Arc::new(KeyValueBackend::new());
        let store = ModelStore::open("m1", StoragePreference::KeyValue, None, Some(kv)).unwrap();
        assert_eq!(store.backend_kind(), BackendKind::KeyValue);
        store.write_shard(0, b"hello").await.unwrap();
        let bytes = store.read_shard(0).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn verify_integrity_detects_corruption() {
        let kv = Arc::new(KeyValueBackend::new());
        let store = ModelStore::open("m1", StoragePreference::KeyValue, None, Some(kv)).unwrap();
        let data = b"shard bytes".to_vec();
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let hex = hex_encode(&hasher.finalize());
        store.write_shard(0, &data).await.unwrap();

        let shard = crate::manifest::ShardDescriptor {
            index: 0,
            filename: "shard_00000.bin".into(),
            offset: 0,
            size: data.len() as u64,
            sha256: hex,
        };
        let manifest = dummy_manifest(vec![shard.clone()]);
        let report = store.verify_integrity(&manifest).await.unwrap();
        assert!(report.is_clean());

        // Flip one byte.
        let mut corrupted = data.clone();
        corrupted[0] ^= 0xFF;
        store.write_shard(0, &corrupted).await.unwrap();
        let report = store.verify_integrity(&manifest).await.unwrap();
        assert_eq!(report.corrupt_shards, vec![0]);
        assert!(report.missing_shards.is_empty());
    }

    #[tokio::test]
    async fn verify_integrity_detects_missing_shard() {
        let kv = Arc::new(KeyValueBackend::new());
        let store = ModelStore::open("m1", StoragePreference::KeyValue, None, Some(kv)).unwrap();
        let shard = crate::manifest::ShardDescriptor {
            index: 0,
            filename: "shard_00000.bin".into(),
            offset: 0,
            size: 4,
            sha256: "deadbeef".into(),
        };
        let manifest = dummy_manifest(vec![shard]);
        let report = store.verify_integrity(&manifest).await.unwrap();
        assert_eq!(report.missing_shards, vec![0]);
    }

    #[tokio::test]
    async fn quota_exceeded_on_write() {
        let kv = Arc::new(KeyValueBackend::with_quota(4));
        let store = ModelStore::open("m1", StoragePreference::KeyValue, None, Some(kv)).unwrap();
        let err = store.write_shard(0, b"too many bytes").await.unwrap_err();
        assert!(matches!(err, DopplerError::QuotaExceeded(_)));
    }
}
