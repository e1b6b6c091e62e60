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

const DEPTHWISE_WGSL: &str = include_str!("depthwise.wgsl");
const DEPTHWISE_WORKGROUP_X: u32 = 8;
const DEPTHWISE_WORKGROUP_Y: u32 = 8;

/// Per-channel square-kernel convolution (`groups == channels`).
#[derive(Debug)]
pub(super) struct DepthwisePipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl DepthwisePipeline {
    pub(super) fn new(device: &wgpu::Device) -> Result<Self> {
        let (pipeline, bind_group_layout) = create_compute_pipeline(
            device,
            "mobilenet_depthwise",
            DEPTHWISE_WGSL,
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
        let uniforms = DepthwiseUniforms::try_from(config)?;
        let uniform_buffer =
            create_uniform_buffer(device, "mobilenet_depthwise_uniforms", &uniforms);
        let output = GpuTensor::uninitialized_with_pool(
            context.clone(),
            Some(pool.clone()),
            config.output_shape_dims(),
            Some("mobilenet_depthwise_output"),
        )?;

        let bind_group = create_bind_group(
            device,
            "mobilenet_depthwise_bg",
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
            "mobilenet_depthwise_pass",
            &self.pipeline,
            &bind_group,
            (
                config.output_width.div_ceil(DEPTHWISE_WORKGROUP_X),
                config.output_height.div_ceil(DEPTHWISE_WORKGROUP_Y),
                config.output_channels,
            ),
        );
        Ok(output)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DepthwiseUniforms {
    width: u32,
    height: u32,
    channels: u32,
    output_width: u32,
    output_height: u32,
    kernel_size: u32,
    stride: u32,
    pad: u32,
    activation_mode: u32,
    _pad: [u32; 3],
}

impl TryFrom<&Conv2dConfig> for DepthwiseUniforms {
    type Error = anyhow::Error;

    fn try_from(value: &Conv2dConfig) -> Result<Self> {
        anyhow::ensure!(
            value.is_depthwise(),
            "depthwise kernel needs groups == channels (got {} groups for {} -> {} channels)",
            value.groups,
            value.input_channels,
            value.output_channels
        );
        anyhow::ensure!(
            value.kernel_width == value.kernel_height
                && value.stride_x == value.stride_y
                && value.pad_x == value.pad_y,
            "depthwise kernel needs square kernel, stride and padding"
        );
        Ok(Self {
            width: value.input_width,
            height: value.input_height,
            channels: value.input_channels,
            output_width: value.output_width,
            output_height: value.output_height,
            kernel_size: value.kernel_width,
            stride: value.stride_x,
            pad: value.pad_x,
            activation_mode: activation_mode(value.activation),
            _pad: [0; 3],
        })
    }
}
