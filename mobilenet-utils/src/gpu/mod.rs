//! GPU context management helpers built on top of `wgpu`.
//!
//! Device and queue creation live here so the inference core, the benchmark
//! driver, and the test suites share one initialization path, with a clean
//! "no adapter" outcome that callers can turn into a CPU fallback or a skipped
//! test.

pub mod buffer_pool;
pub use buffer_pool::{BufferPoolError, GpuBufferPool};

use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, info, warn};
use pollster::block_on;
use thiserror::Error;
use wgpu::{
    Adapter, AdapterInfo, Backends, Device, DeviceDescriptor, ExperimentalFeatures, Features,
    Instance, InstanceDescriptor, InstanceFlags, Limits, MemoryHints, PollType, PowerPreference,
    Queue, RequestAdapterError, RequestAdapterOptions, RequestDeviceError, Trace,
};

/// High-level configuration for creating a [`GpuContext`].
#[derive(Clone, Debug)]
pub struct GpuContextOptions {
    /// Whether GPU support is enabled.
    pub enabled: bool,
    /// Allow environment variables (e.g. `WGPU_BACKEND`) to override defaults.
    pub respect_env: bool,
    /// Which backends should be considered.
    pub backends: Backends,
    /// Instance flags (debug/validation toggles).
    pub flags: InstanceFlags,
    /// Adapter preference (high-performance vs low-power).
    pub power_preference: PowerPreference,
    /// Force wgpu to pick its fallback adapter implementation.
    pub force_fallback_adapter: bool,
    /// Features that must be present on the selected adapter.
    pub required_features: Features,
    /// Limits that must be available. Defaults to the adapter limits.
    pub required_limits: Option<Limits>,
    /// Optional debug label for the logical device.
    pub label: Option<String>,
    /// Memory allocation hints forwarded to `wgpu`.
    pub memory_hints: Option<MemoryHints>,
}

impl Default for GpuContextOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            backends: Backends::PRIMARY,
            flags: InstanceFlags::from_build_config(),
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_features: Features::empty(),
            required_limits: None,
            label: Some("MobileNet GPU context".to_string()),
            memory_hints: Some(MemoryHints::Performance),
        }
    }
}

impl GpuContextOptions {
    /// Convenience helper for explicitly disabling GPU usage.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Result of attempting to initialize a GPU context while supporting CPU fallback.
#[derive(Debug)]
pub enum GpuAvailability {
    /// GPU resources are ready to use.
    Available(Arc<GpuContext>),
    /// GPU code path has been disabled by configuration.
    Disabled { reason: String },
    /// GPU initialization failed; callers may fall back to the CPU reference path.
    Unavailable { error: GpuInitError },
}

impl GpuAvailability {
    /// Returns `true` when a GPU context was created successfully.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// Returns a reference to the underlying GPU context when it exists.
    pub fn context(&self) -> Option<&Arc<GpuContext>> {
        match self {
            Self::Available(ctx) => Some(ctx),
            _ => None,
        }
    }
}

/// Shared GPU device/queue wrapper with a little bit of metadata.
#[derive(Debug)]
pub struct GpuContext {
    device: Device,
    queue: Queue,
    info: AdapterInfo,
    limits: Limits,
    // Held so the adapter outlives the device on backends that care.
    _adapter: Adapter,
    _instance: Instance,
}

impl GpuContext {
    /// Initialize a new GPU context with the provided options.
    pub fn initialize(options: &GpuContextOptions) -> Result<Self, GpuInitError> {
        if !options.enabled {
            return Err(GpuInitError::Disabled);
        }

        let mut instance_desc = if options.respect_env {
            InstanceDescriptor::from_env_or_default()
        } else {
            InstanceDescriptor::default()
        };

        let backends = if options.respect_env {
            options.backends.with_env()
        } else {
            options.backends
        };

        instance_desc.backends = backends;
        instance_desc.flags = if options.respect_env {
            options.flags.with_env()
        } else {
            options.flags
        };

        let instance = Instance::new(&instance_desc);
        let adapter = block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))
        .map_err(|source| GpuInitError::Adapter { backends, source })?;

        let info = adapter.get_info();
        let supported_features = adapter.features();
        if !supported_features.contains(options.required_features) {
            return Err(GpuInitError::MissingFeatures {
                requested: options.required_features,
                supported: supported_features,
            });
        }

        let limits = options
            .required_limits
            .clone()
            .unwrap_or_else(|| adapter.limits());
        debug!(
            target: "mobilenet::gpu",
            "Requesting device with max storage binding {} bytes, max workgroups/dim {}",
            limits.max_storage_buffer_binding_size,
            limits.max_compute_workgroups_per_dimension
        );

        let device_desc = DeviceDescriptor {
            label: options.label.as_deref(),
            required_features: options.required_features,
            required_limits: limits.clone(),
            experimental_features: ExperimentalFeatures::default(),
            memory_hints: options.memory_hints.clone().unwrap_or_default(),
            trace: Trace::default(),
        };

        let (device, queue) =
            block_on(adapter.request_device(&device_desc)).map_err(GpuInitError::from)?;

        info!(
            target: "mobilenet::gpu",
            "Using GPU adapter '{}' ({:?}/{:?})",
            info.name, info.backend, info.device_type
        );

        Ok(Self {
            device,
            queue,
            info,
            limits,
            _adapter: adapter,
            _instance: instance,
        })
    }

    /// Attempt to create a GPU context, reporting why it is unavailable instead of failing.
    pub fn init_with_fallback(options: &GpuContextOptions) -> GpuAvailability {
        if !options.enabled {
            return GpuAvailability::Disabled {
                reason: "GPU execution disabled via configuration".to_string(),
            };
        }

        match Self::initialize(options) {
            Ok(ctx) => GpuAvailability::Available(Arc::new(ctx)),
            Err(GpuInitError::Disabled) => GpuAvailability::Disabled {
                reason: "GPU execution disabled via configuration".to_string(),
            },
            Err(err) => {
                warn!(
                    target: "mobilenet::gpu",
                    "GPU initialization failed ({err})."
                );
                GpuAvailability::Unavailable { error: err }
            }
        }
    }

    /// Returns the shared `wgpu::Device`.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the shared `wgpu::Queue`.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Adapter metadata handy for logging and reports.
    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    /// `wgpu::Limits` negotiated for this context.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Block until every submission on the queue has finished executing.
    ///
    /// This is the device-wide barrier used between the last kernel of a
    /// forward pass and reading the elapsed time.
    pub fn synchronize(&self) -> anyhow::Result<()> {
        self.device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| anyhow!("device poll failed while synchronizing: {e}"))?;
        Ok(())
    }
}

/// Tracks GPU initialization failures.
#[derive(Debug, Error)]
pub enum GpuInitError {
    #[error("GPU adapter request failed for {backends:?}: {source}")]
    Adapter {
        backends: Backends,
        #[source]
        source: RequestAdapterError,
    },
    #[error(
        "GPU adapter missing required features (requested={requested:?}, supported={supported:?})"
    )]
    MissingFeatures {
        requested: Features,
        supported: Features,
    },
    #[error("GPU device creation failed: {0}")]
    Device(#[from] RequestDeviceError),
    #[error("GPU execution disabled")]
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_options_skip_gpu_setup() {
        let options = GpuContextOptions::disabled();
        match GpuContext::init_with_fallback(&options) {
            GpuAvailability::Disabled { .. } => {}
            other => panic!("expected GPU to be disabled, got {other:?}"),
        }
    }

    #[test]
    fn initialize_rejects_disabled_options() {
        let err = GpuContext::initialize(&GpuContextOptions::disabled())
            .expect_err("disabled options must not create a device");
        assert!(matches!(err, GpuInitError::Disabled));
    }
}
