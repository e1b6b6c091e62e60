use super::utils::{
    MAX_WORKGROUPS_PER_DIM, create_bind_group, create_compute_pipeline, create_uniform_buffer,
    read_only, read_write, submit_compute_pass, uniform_entry,
};
use crate::gpu::GpuTensor;
use crate::layers::PoolConfig;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use mobilenet_utils::gpu::{GpuBufferPool, GpuContext};
use std::sync::Arc;

const AVG_POOL_WGSL: &str = include_str!("avg_pool.wgsl");

/// Global average pooling: `[1, C, H, W]` to `[1, C]`.
#[derive(Debug)]
pub(super) struct AvgPoolPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl AvgPoolPipeline {
    pub(super) fn new(device: &wgpu::Device) -> Result<Self> {
        let (pipeline, bind_group_layout) = create_compute_pipeline(
            device,
            "mobilenet_avg_pool",
            AVG_POOL_WGSL,
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
        input: &GpuTensor,
        config: &PoolConfig,
    ) -> Result<GpuTensor> {
        anyhow::ensure!(
            config.channels <= MAX_WORKGROUPS_PER_DIM,
            "global average pool supports at most {MAX_WORKGROUPS_PER_DIM} channels (got {})",
            config.channels
        );
        let device = context.device();
        let uniforms = PoolUniforms {
            channels: config.channels,
            height: config.height,
            width: config.width,
            _pad: 0,
        };
        let uniform_buffer =
            create_uniform_buffer(device, "mobilenet_avg_pool_uniforms", &uniforms);
        let output = GpuTensor::uninitialized_with_pool(
            context.clone(),
            Some(pool.clone()),
            config.output_shape_dims(),
            Some("mobilenet_avg_pool_output"),
        )?;
        let bind_group = create_bind_group(
            device,
            "mobilenet_avg_pool_bg",
            &self.bind_group_layout,
            &[input.buffer(), output.buffer(), &uniform_buffer],
        );
        submit_compute_pass(
            device,
            context.queue(),
            "mobilenet_avg_pool_pass",
            &self.pipeline,
            &bind_group,
            (config.channels, 1, 1),
        );
        Ok(output)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PoolUniforms {
    channels: u32,
    height: u32,
    width: u32,
    _pad: u32,
}
