use super::utils::{
    create_bind_group, create_compute_pipeline, create_uniform_buffer, read_only, read_write,
    shader_len, split_dispatch, submit_compute_pass, uniform_entry,
};
use crate::gpu::GpuTensor;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use mobilenet_utils::gpu::{GpuBufferPool, GpuContext};
use std::sync::Arc;

const ACTIVATION_WGSL: &str = include_str!("activation.wgsl");
const ACTIVATION_WORKGROUP_SIZE: u32 = 256;

/// Standalone ReLU6 for plans that keep activations unfused.
#[derive(Debug)]
pub(super) struct ActivationPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl ActivationPipeline {
    pub(super) fn new(device: &wgpu::Device) -> Result<Self> {
        let (pipeline, bind_group_layout) = create_compute_pipeline(
            device,
            "mobilenet_relu6",
            ACTIVATION_WGSL,
            &[read_only(0), read_write(1), uniform_entry(2)],
        );
        Ok(Self {
            pipeline,
            bind_group_layout,
        })
    }

    pub(super) fn execute(
        &self,
        context: &Arc<GpuContext>,
        pool: &Arc<GpuBufferPool>,
        tensor: &GpuTensor,
    ) -> Result<GpuTensor> {
        let device = context.device();
        let len = shader_len(tensor.shape().elements())?;
        let output = GpuTensor::uninitialized_with_pool(
            context.clone(),
            Some(pool.clone()),
            tensor.shape().dims().to_vec(),
            Some("mobilenet_relu6_output"),
        )?;
        let uniforms = ElementwiseUniforms::new(len);
        let uniform_buffer = create_uniform_buffer(device, "mobilenet_relu6_uniforms", &uniforms);
        let bind_group = create_bind_group(
            device,
            "mobilenet_relu6_bg",
            &self.bind_group_layout,
            &[tensor.buffer(), output.buffer(), &uniform_buffer],
        );
        let (x, y) = split_dispatch(len.div_ceil(ACTIVATION_WORKGROUP_SIZE));
        submit_compute_pass(
            device,
            context.queue(),
            "mobilenet_relu6_pass",
            &self.pipeline,
            &bind_group,
            (x, y, 1),
        );
        Ok(output)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(super) struct ElementwiseUniforms {
    len: u32,
    _pad: [u32; 3],
}

impl ElementwiseUniforms {
    pub(super) fn new(len: u32) -> Self {
        Self { len, _pad: [0; 3] }
    }
}
