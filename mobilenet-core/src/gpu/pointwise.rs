use super::utils::{
    create_bind_group, create_compute_pipeline, create_uniform_buffer, read_only, read_write,
    submit_compute_pass, uniform_entry,
};
use crate::gpu::GpuTensor;
use crate::layers::{Conv2dConfig, activation_mode};

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use mobilenet_utils::gpu::{GpuBufferPool, GpuContext};
use std::sync::Arc;

const POINTWISE_WGSL: &str = include_str!("pointwise.wgsl");
const POINTWISE_TILE: u32 = 16;

/// 1x1 convolution executed as a shared-memory tiled GEMM.
///
/// Expansion and projection layers carry most of the network's FLOPs, so
/// they get their own kernel instead of the generic direct convolution.
#[derive(Debug)]
pub(super) struct PointwisePipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl PointwisePipeline {
    pub(super) fn new(device: &wgpu::Device) -> Result<Self> {
        let (pipeline, bind_group_layout) = create_compute_pipeline(
            device,
            "mobilenet_pointwise",
            POINTWISE_WGSL,
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
        config: &Conv2dConfig,
    ) -> Result<GpuTensor> {
        anyhow::ensure!(
            config.is_pointwise(),
            "pointwise kernel needs a 1x1, stride 1, unpadded, ungrouped convolution"
        );
        let device = context.device();
        let pixels = config.input_width * config.input_height;
        let uniforms = PointwiseUniforms {
            pixels,
            input_channels: config.input_channels,
            output_channels: config.output_channels,
            activation_mode: activation_mode(config.activation),
        };
        let uniform_buffer =
            create_uniform_buffer(device, "mobilenet_pointwise_uniforms", &uniforms);
        let output = GpuTensor::uninitialized_with_pool(
            context.clone(),
            Some(pool.clone()),
            config.output_shape_dims(),
            Some("mobilenet_pointwise_output"),
        )?;

        let bind_group = create_bind_group(
            device,
            "mobilenet_pointwise_bg",
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
            "mobilenet_pointwise_pass",
            &self.pipeline,
            &bind_group,
            (
                pixels.div_ceil(POINTWISE_TILE),
                config.output_channels.div_ceil(POINTWISE_TILE),
                1,
            ),
        );
        Ok(output)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PointwiseUniforms {
    pixels: u32,
    input_channels: u32,
    output_channels: u32,
    activation_mode: u32,
}
