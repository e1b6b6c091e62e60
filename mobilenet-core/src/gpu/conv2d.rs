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

const CONV2D_WGSL: &str = include_str!("conv2d.wgsl");
const CONV_WORKGROUP_X: u32 = 8;
const CONV_WORKGROUP_Y: u32 = 8;

/// Direct convolution with arbitrary kernel, stride, padding and groups.
///
/// One invocation computes one output element; the z dimension of the
/// dispatch walks output channels.
#[derive(Debug)]
pub(super) struct Conv2dPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl Conv2dPipeline {
    pub(super) fn new(device: &wgpu::Device) -> Result<Self> {
        let (pipeline, bind_group_layout) = create_compute_pipeline(
            device,
            "mobilenet_conv2d",
            CONV2D_WGSL,
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
        let device = context.device();
        let uniforms = Conv2dUniforms::from(config);
        let uniform_buffer = create_uniform_buffer(device, "mobilenet_conv2d_uniforms", &uniforms);
        let output = GpuTensor::uninitialized_with_pool(
            context.clone(),
            Some(pool.clone()),
            config.output_shape_dims(),
            Some("mobilenet_conv2d_output"),
        )?;

        let bind_group = create_bind_group(
            device,
            "mobilenet_conv2d_bg",
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
            "mobilenet_conv2d_pass",
            &self.pipeline,
            &bind_group,
            (
                config.output_width.div_ceil(CONV_WORKGROUP_X),
                config.output_height.div_ceil(CONV_WORKGROUP_Y),
                config.output_channels,
            ),
        );
        Ok(output)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(super) struct Conv2dUniforms {
    input_width: u32,
    input_height: u32,
    input_channels: u32,
    output_width: u32,
    output_height: u32,
    output_channels: u32,
    kernel_width: u32,
    kernel_height: u32,
    stride_x: u32,
    stride_y: u32,
    pad_x: u32,
    pad_y: u32,
    groups: u32,
    activation_mode: u32,
    _pad: [u32; 2],
}

impl From<&Conv2dConfig> for Conv2dUniforms {
    fn from(value: &Conv2dConfig) -> Self {
        Self {
            input_width: value.input_width,
            input_height: value.input_height,
            input_channels: value.input_channels,
            output_width: value.output_width,
            output_height: value.output_height,
            output_channels: value.output_channels,
            kernel_width: value.kernel_width,
            kernel_height: value.kernel_height,
            stride_x: value.stride_x,
            stride_y: value.stride_y,
            pad_x: value.pad_x,
            pad_y: value.pad_y,
            groups: value.groups,
            activation_mode: activation_mode(value.activation),
            _pad: [0; 2],
        }
    }
}
