//! WGSL compute kernels for MobileNetV2 inference.
//!
//! Every layer type has its own pipeline module (`*.rs` + `*.wgsl`);
//! [`GpuInferenceOps`] bundles them behind the [`crate::layers::LayerKernels`]
//! interface so the network executor never touches `wgpu` directly.

mod activation;
mod add;
mod avg_pool;
mod conv2d;
mod depthwise;
mod linear;
mod pointwise;
mod utils;

pub mod ops;
pub mod tensor;


pub use ops::GpuInferenceOps;
pub use tensor::GpuTensor;
