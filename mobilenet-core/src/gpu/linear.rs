use super::utils::{
    MAX_WORKGROUPS_PER_DIM, create_bind_group, create_compute_pipeline, create_uniform_buffer,
    read_only, read_write, submit_compute_pass, uniform_entry,
};
use crate::gpu::GpuTensor;
use crate::layers::LinearConfig;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use mobilenet_utils::gpu::{GpuBufferPool, GpuContext};
use std::sync::Arc;

const LINEAR_WGSL: &str = include_str!("linear.wgsl");
const LINEAR_WORKGROUP_SIZE: u32 = 64;

/// Fully connected classifier layer, one invocation per output feature.
#[derive(Debug)]
pub(super) struct LinearPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl LinearPipeline {
    pub(super) fn new(device: &wgpu::Device) -> Result<Self> {
        let (pipeline, bind_group_layout) = create_compute_pipeline(
            device,
            "mobilenet_linear",
            LINEAR_WGSL,
            &[
                read_only(0),
                read_only(1),
                read_only(2),
                read_write(3),
                uniform_entry(4),
            ],
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
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &LinearConfig,
    ) -> Result<GpuTensor> {
        let workgroups = config.out_features.div_ceil(LINEAR_WORKGROUP_SIZE);
        anyhow::ensure!(
            workgroups <= MAX_WORKGROUPS_PER_DIM,
            "linear layer with {} outputs exceeds the dispatch limit",
            config.out_features
        );
        let device = context.device();
        let uniforms = LinearUniforms {
            in_features: config.in_features,
            out_features: config.out_features,
            _pad: [0; 2],
        };
        let uniform_buffer = create_uniform_buffer(device, "mobilenet_linear_uniforms", &uniforms);
        let output = GpuTensor::uninitialized_with_pool(
            context.clone(),
            Some(pool.clone()),
            config.output_shape_dims(),
            Some("mobilenet_linear_output"),
        )?;
        let bind_group = create_bind_group(
            device,
            "mobilenet_linear_bg",
            &self.bind_group_layout,
            &[
                input.buffer(),
                weights.buffer(),
                bias.buffer(),
                output.buffer(),
                &uniform_buffer,
            ],
        );
        submit_compute_pass(
            device,
            context.queue(),
            "mobilenet_linear_pass",
            &self.pipeline,
            &bind_group,
            (workgroups, 1, 1),
        );
        Ok(output)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LinearUniforms {
    in_features: u32,
    out_features: u32,
    _pad: [u32; 2],
}
