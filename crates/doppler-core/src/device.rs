//! Device: accelerator capability probe, shader pipeline cache, and
//! timestamp queries (spec §4.3).
//!
//! Kernel dispatch is modeled the way `ai00-core::run::SoftmaxBackend`
//! models its own GPU-vs-alternate split (`WebGpu(Context) | Hip`):
//! an enum over backends rather than an inheritance hierarchy, per
//! spec §9 "Dynamic dispatch over kernels". The `Cpu` backend is an
//! exact-arithmetic reference implementation used by every test in this
//! crate; the `WebGpu` backend (behind the `webgpu` feature) issues real
//! compute-pipeline dispatches through `wgpu`.

use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::error::{DopplerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Active,
    Lost,
}

#[derive(Debug, Clone)]
pub struct Capabilities {
    pub max_buffer_size: u64,
    pub max_storage_bindings: u32,
    pub supports_fp16: bool,
    pub supports_subgroups: bool,
    pub supports_timestamp_queries: bool,
    pub preferred_workgroup_size: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        // Conservative defaults matching a mid-range WebGPU-class adapter.
        Self {
            max_buffer_size: 1 << 30,
            max_storage_bindings: 8,
            supports_fp16: true,
            supports_subgroups: false,
            supports_timestamp_queries: false,
            preferred_workgroup_size: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub adapter_name: String,
    pub backend_name: &'static str,
}

/// `(kernelId, specializationKey) -> compiledPipeline` lookup, per spec
/// §4.3/§9. The specialization key encodes dtypes, tile sizes, and feature
/// flags; recompilation only happens on cache miss. Grounded on the
/// `PipelineCache` pattern in the pack's renderer examples (contiguous
/// storage + hashmap lookup keyed by a full descriptor hash), simplified
/// here to a string key since kernels are few and well-known.
#[derive(Default)]
pub struct PipelineCache {
    compiled: Mutex<FxHashMap<(&'static str, String), CompiledPipelineHandle>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompiledPipelineHandle(u64);

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached pipeline for `(kernel_id, specialization_key)`,
    /// compiling (via `compile`) only on a miss.
    pub fn get_or_compile(
        &self,
        kernel_id: &'static str,
        specialization_key: &str,
        compile: impl FnOnce() -> CompiledPipelineHandle,
    ) -> CompiledPipelineHandle {
        let mut compiled = self.compiled.lock().expect("pipeline cache mutex poisoned");
        let key = (kernel_id, specialization_key.to_string());
        if let Some(handle) = compiled.get(&key) {
            return *handle;
        }
        let handle = compile();
        compiled.insert(key, handle);
        handle
    }

    pub fn len(&self) -> usize {
        self.compiled.lock().expect("pipeline cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static NEXT_PIPELINE_HANDLE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

pub fn allocate_pipeline_handle() -> CompiledPipelineHandle {
    CompiledPipelineHandle(NEXT_PIPELINE_HANDLE.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
}

enum Backend {
    Cpu,
    #[cfg(feature = "webgpu")]
    WebGpu { device: wgpu::Device, queue: wgpu::Queue },
}

/// Process-wide singleton accelerator handle (spec §9 "Shared ownership of
/// device / buffer pool"). Multiple pipelines reference it as a
/// non-owning `Arc` handle; the device never references pipelines back.
pub struct Device {
    backend: Backend,
    capabilities: Capabilities,
    platform: PlatformConfig,
    pipeline_cache: PipelineCache,
    state: Mutex<DeviceState>,
}

impl Device {
    /// Probes a CPU reference backend. Always available; used for every
    /// test in this crate and as a graceful fallback when no WebGPU-class
    /// adapter is present.
    pub fn new_cpu() -> Self {
        Self {
            backend: Backend::Cpu,
            capabilities: Capabilities::default(),
            platform: PlatformConfig {
                adapter_name: "cpu-reference".into(),
                backend_name: "cpu",
            },
            pipeline_cache: PipelineCache::new(),
            state: Mutex::new(DeviceState::Active),
        }
    }

    #[cfg(feature = "webgpu")]
    pub async fn new_webgpu() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .ok_or_else(|| DopplerError::DeviceLost("no WebGPU-class adapter available".into()))?;
        let info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default(), None)
            .await
            .map_err(|e| DopplerError::DeviceLost(e.to_string()))?;
        let limits = adapter.limits();
        let features = adapter.features();
        Ok(Self {
            backend: Backend::WebGpu { device, queue },
            capabilities: Capabilities {
                max_buffer_size: limits.max_buffer_size,
                max_storage_bindings: limits.max_storage_buffers_per_shader_stage,
                supports_fp16: features.contains(wgpu::Features::SHADER_F16),
                supports_subgroups: false,
                supports_timestamp_queries: features.contains(wgpu::Features::TIMESTAMP_QUERY),
                preferred_workgroup_size: 256,
            },
            platform: PlatformConfig {
                adapter_name: info.name,
                backend_name: "webgpu",
            },
            pipeline_cache: PipelineCache::new(),
            state: Mutex::new(DeviceState::Active),
        })
    }

    pub fn get_capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn get_platform_config(&self) -> &PlatformConfig {
        &self.platform
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipeline_cache
    }

    pub fn is_cpu_backend(&self) -> bool {
        matches!(self.backend, Backend::Cpu)
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock().expect("device state mutex poisoned")
    }

    /// Marks the device lost. All buffer handles issued by it are
    /// considered invalidated from this point on (spec §4.3).
    pub fn mark_lost(&self) {
        *self.state.lock().expect("device state mutex poisoned") = DeviceState::Lost;
    }

    pub fn ensure_active(&self) -> Result<()> {
        match self.state() {
            DeviceState::Active => Ok(()),
            DeviceState::Lost => Err(DopplerError::DeviceLost(
                "accelerator reported device loss; create a new pipeline".into(),
            )),
        }
    }
}

/// Not a real adapter list on the CPU backend — returns a single synthetic
/// entry, the way a WebGPU host would list `Instance::enumerate_adapters`
/// results for UI display (spec §6's external adapter-selection UI is out
/// of this core's scope; this exists only for `getPlatformConfig`/tests).
pub fn list_adapter_names_cpu() -> Vec<String> {
    vec!["cpu-reference".to_string()]
}
