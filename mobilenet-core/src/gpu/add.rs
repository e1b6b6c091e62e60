use super::activation::ElementwiseUniforms;
use super::utils::{
    create_bind_group, create_compute_pipeline, create_uniform_buffer, read_only, read_write,
    shader_len, split_dispatch, submit_compute_pass, uniform_entry,
};
use crate::gpu::GpuTensor;

use anyhow::Result;
use mobilenet_utils::gpu::{GpuBufferPool, GpuContext};
use std::sync::Arc;

const ADD_WGSL: &str = include_str!("add.wgsl");
const ADD_WORKGROUP_SIZE: u32 = 256;

/// Element-wise sum used for residual connections.
#[derive(Debug)]
pub(super) struct AddPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl AddPipeline {
    pub(super) fn new(device: &wgpu::Device) -> Result<Self> {
        let (pipeline, bind_group_layout) = create_compute_pipeline(
            device,
            "mobilenet_add",
            ADD_WGSL,
            &[read_only(0), read_only(1), read_write(2), uniform_entry(3)],
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
        lhs: &GpuTensor,
        rhs: &GpuTensor,
    ) -> Result<GpuTensor> {
        let device = context.device();
        let len = shader_len(lhs.shape().elements())?;
        let output = GpuTensor::uninitialized_with_pool(
            context.clone(),
            Some(pool.clone()),
            lhs.shape().dims().to_vec(),
            Some("mobilenet_add_output"),
        )?;
        let uniforms = ElementwiseUniforms::new(len);
        let uniform_buffer = create_uniform_buffer(device, "mobilenet_add_uniforms", &uniforms);
        let bind_group = create_bind_group(
            device,
            "mobilenet_add_bg",
            &self.bind_group_layout,
            &[lhs.buffer(), rhs.buffer(), output.buffer(), &uniform_buffer],
        );
        let (x, y) = split_dispatch(len.div_ceil(ADD_WORKGROUP_SIZE));
        submit_compute_pass(
            device,
            context.queue(),
            "mobilenet_add_pass",
            &self.pipeline,
            &bind_group,
            (x, y, 1),
        );
        Ok(output)
    }
}
