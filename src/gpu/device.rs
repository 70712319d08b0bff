// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and select the first non-CPU one.
//   - Provide dispatch-size helpers for 1D (per-slot) and 2D (per-pixel)
//     kernels.
//   - Provide `scoped()` — a fallible-call wrapper that runs a closure
//     under wgpu error scopes and surfaces validation/OOM errors as
//     values instead of letting them reach the uncaptured-error handler
//     (which would otherwise panic the process).
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power-preference heuristics that
// may grab llvmpipe/softpipe on WSL2 (where the software renderer appears
// as a valid Vulkan device). We enumerate explicitly and prefer real
// hardware, falling back to whatever exists only as a last resort.

use std::fmt;
use std::sync::Arc;

/// Workgroup width for 1D dispatches (one thread per keypoint slot).
pub const WORKGROUP_1D: u32 = 64;
/// Workgroup dimensions for 2D dispatches (one thread per pixel).
pub const WORKGROUP_2D: (u32, u32) = (16, 8);

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The core GPU context: device, queue, and adapter info.
///
/// Create once and share; it is expensive to create (Vulkan instance +
/// device initialization) while `wgpu::Device`/`wgpu::Queue` are internally
/// reference-counted and cheap to clone.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. `_instance` is declared
/// last so the `wgpu::Instance` outlives `device` and `queue`; dzn (the
/// D3D12-to-Vulkan layer on WSL2) crashes when the Vulkan instance dies
/// while device-level objects still reference it.
pub struct GpuDevice {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_info: AdapterInfo,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped. Never accessed directly.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` using the first non-CPU Vulkan adapter found.
    ///
    /// # Errors
    /// Returns `Err` if no adapter is found or the device request fails.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async())
    }

    async fn init_async() -> Result<Self, GpuError> {
        // Vulkan only — no DX12, no Metal, no WebGPU. The noncompliant-
        // adapter flag lets wgpu enumerate dzn on WSL2, which declares
        // itself non-conformant but supports the storage-buffer compute
        // dispatches used here.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let all_adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .collect();

        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }

        for a in &all_adapters {
            let info = a.get_info();
            eprintln!(
                "[descry] Vulkan adapter: {} ({:?}, {:?})",
                info.name, info.backend, info.device_type
            );
        }

        // Tier 1: real hardware (or passthrough). Tier 2: anything at all,
        // even a software rasterizer — the adapter name is logged above so
        // the selection is visible.
        let adapter = all_adapters
            .into_iter()
            .find(|a| {
                matches!(
                    a.get_info().device_type,
                    wgpu::DeviceType::DiscreteGpu
                        | wgpu::DeviceType::IntegratedGpu
                        | wgpu::DeviceType::VirtualGpu
                        | wgpu::DeviceType::Other
                )
            })
            .or_else(|| {
                instance
                    .enumerate_adapters(wgpu::Backends::VULKAN)
                    .into_iter()
                    .next()
            })
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("descry"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        Ok(GpuDevice {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            _instance: instance,
        })
    }

    /// Workgroup count for a 1D dispatch over `n` slots. Ceiling division;
    /// the shader guards against slot indices >= n.
    pub fn dispatch_1d(&self, n: u32) -> u32 {
        (n + WORKGROUP_1D - 1) / WORKGROUP_1D
    }

    /// Workgroup counts for a 2D dispatch over an image. Ceiling division;
    /// the shader guards against out-of-bounds pixel coordinates.
    pub fn dispatch_2d(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        let (wx, wy) = WORKGROUP_2D;
        ((img_w + wx - 1) / wx, (img_h + wy - 1) / wy)
    }

    /// Run `f` under error scopes and surface any validation or
    /// out-of-memory error it raised as a `GpuError` value.
    ///
    /// Buffer and pipeline creation in wgpu report failure through the
    /// device's error machinery rather than return values; without a scope
    /// an allocation failure would surface as an uncaptured-error panic at
    /// some later poll. Wrapping construction and per-call encoding here is
    /// what makes those paths fallible.
    pub fn scoped<T>(&self, context: &str, f: impl FnOnce() -> T) -> Result<T, GpuError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let value = f();
        let oom = pollster::block_on(self.device.pop_error_scope());
        let validation = pollster::block_on(self.device.pop_error_scope());

        if let Some(e) = oom {
            return Err(GpuError::OutOfMemory {
                context: context.to_string(),
                description: e.to_string(),
            });
        }
        if let Some(e) = validation {
            return Err(GpuError::Validation {
                context: context.to_string(),
                description: e.to_string(),
            });
        }
        Ok(value)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ adapter: {} }}", self.adapter_info)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from GPU device initialization and scoped GPU calls.
#[derive(Debug)]
pub enum GpuError {
    /// No Vulkan adapter found. On WSL2: check that Vulkan is installed
    /// and `vulkaninfo` shows a real GPU.
    NoSuitableAdapter,
    /// wgpu device request failed (driver issue, unsupported limits, …).
    DeviceRequest(wgpu::RequestDeviceError),
    /// Allocation failed inside a scoped call.
    OutOfMemory { context: String, description: String },
    /// A command or resource was rejected inside a scoped call.
    Validation { context: String, description: String },
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoSuitableAdapter => write!(
                f,
                "no suitable Vulkan adapter found (only CPU/software renderers visible)"
            ),
            GpuError::DeviceRequest(e) => write!(f, "device request failed: {e}"),
            GpuError::OutOfMemory { context, description } => {
                write!(f, "out of device memory in {context}: {description}")
            }
            GpuError::Validation { context, description } => {
                write!(f, "validation error in {context}: {description}")
            }
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceRequest(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
