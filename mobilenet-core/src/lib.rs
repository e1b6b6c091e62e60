//! Core MobileNetV2 inference primitives.
//!
//! This crate provides the WGSL layer kernels, the CPU reference kernels,
//! the declarative block table, and the executor that replays a validated
//! network plan on either backend.

#[macro_use]
mod macros;

/// Output checking against reference logits.
pub mod compare;
/// GPU tensors and compute pipelines.
pub mod gpu;
/// Layer geometry, activation kinds, and the backend kernel interface.
pub mod layers;
/// Generic plan executor.
pub mod pipeline;
/// Block table flattened into kernel stages.
pub mod plan;
/// Multi-threaded CPU reference kernels.
pub mod reference;
/// GPU and CPU forward-pass runtimes.
pub mod runtime;
/// Host tensors and shapes.
pub mod tensor;
/// MobileNetV2 block table.
pub mod topology;
/// Weight sets and the manifest format.
pub mod weights;

pub use compare::{OutputComparison, compare_outputs};
pub use gpu::{GpuInferenceOps, GpuTensor};
pub use layers::{
    ActivationKind, Conv2dChannels, Conv2dConfig, Conv2dOptions, LayerKernels, LinearConfig,
    PoolConfig, ShapedTensor, SpatialDims, WeightProvider,
};
pub use pipeline::execute_plan;
pub use plan::{NetworkPlan, PlanOptions, PlannedStage, Stage, WeightSpec};
pub use reference::CpuKernels;
pub use runtime::{
    CpuMobileNet, GpuMobileNet, GpuWeights, InferenceBackend, PassTimer,
    estimate_inference_memory,
};
pub use tensor::{HostTensor, TensorShape};
pub use topology::{BlockKind, BlockSpec, LayerNames, LayerRole, MOBILENET_V2_BLOCKS};
pub use weights::{MANIFEST_FILE, WeightSet};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
