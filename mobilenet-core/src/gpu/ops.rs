use super::activation::ActivationPipeline;
use super::add::AddPipeline;
use super::avg_pool::AvgPoolPipeline;
use super::conv2d::Conv2dPipeline;
use super::depthwise::DepthwisePipeline;
use super::linear::LinearPipeline;
use super::pointwise::PointwisePipeline;
use super::tensor::GpuTensor;
use crate::layers::{Conv2dConfig, LayerKernels, LinearConfig, PoolConfig};

use anyhow::{Context, Result};
use mobilenet_utils::gpu::{GpuBufferPool, GpuContext};
use std::sync::Arc;

/// Collection of GPU-backed MobileNetV2 primitives.
///
/// Owns the compiled WGSL pipelines and the buffer pool that every
/// intermediate tensor is carved from, so a single instance serves all
/// layers of all passes. Each call records one compute pass and submits it
/// without waiting; queue order alone sequences dependent layers.
#[derive(Debug)]
pub struct GpuInferenceOps {
    context: Arc<GpuContext>,
    buffer_pool: Arc<GpuBufferPool>,
    conv2d: Conv2dPipeline,
    depthwise: DepthwisePipeline,
    pointwise: PointwisePipeline,
    activation: ActivationPipeline,
    add: AddPipeline,
    avg_pool: AvgPoolPipeline,
    linear: LinearPipeline,
}

impl GpuInferenceOps {
    /// Create the GPU pipelines from an existing [`GpuContext`].
    ///
    /// `memory_limit` caps the bytes the buffer pool may hold at once.
    pub fn new(context: Arc<GpuContext>, memory_limit: Option<u64>) -> Result<Self> {
        let device = context.device();
        let buffer_pool = Arc::new(GpuBufferPool::new(context.clone(), memory_limit));
        Ok(Self {
            conv2d: Conv2dPipeline::new(device)?,
            depthwise: DepthwisePipeline::new(device)?,
            pointwise: PointwisePipeline::new(device)?,
            activation: ActivationPipeline::new(device)?,
            add: AddPipeline::new(device)?,
            avg_pool: AvgPoolPipeline::new(device)?,
            linear: LinearPipeline::new(device)?,
            buffer_pool,
            context,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    /// Upload host data into a pooled GPU tensor.
    pub fn upload_tensor<D>(&self, dims: D, data: &[f32], label: Option<&str>) -> Result<GpuTensor>
    where
        D: Into<Vec<usize>>,
    {
        GpuTensor::from_slice_with_pool(
            self.context.clone(),
            Some(self.buffer_pool.clone()),
            dims,
            data,
            label,
        )
    }

    /// Upload host data into an existing GPU tensor.
    pub fn upload_to_tensor(&self, tensor: &GpuTensor, data: &[f32]) -> Result<()> {
        self.ensure_same_context(tensor, "upload target")?;
        tensor.write(data)
    }

    /// Download a tensor back to host memory (waits for pending work).
    pub fn download_tensor(&self, tensor: &GpuTensor) -> Result<Vec<f32>> {
        tensor.to_vec()
    }

    /// Total bytes currently allocated through the buffer pool.
    pub fn memory_usage(&self) -> u64 {
        self.buffer_pool.memory_usage()
    }

    pub fn memory_limit(&self) -> Option<u64> {
        self.buffer_pool.memory_limit()
    }

    fn ensure_same_context(&self, tensor: &GpuTensor, label: &str) -> Result<()> {
        anyhow::ensure!(
            Arc::ptr_eq(tensor.context(), &self.context),
            "{label} tensor was created from a different GPU context"
        );
        Ok(())
    }

    fn ensure_conv_inputs(
        &self,
        op: &str,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &Conv2dConfig,
    ) -> Result<()> {
        config
            .validate(
                input.shape().elements(),
                weights.shape().elements(),
                bias.shape().elements(),
            )
            .with_context(|| format!("{op} shape check"))?;
        self.ensure_same_context(input, &format!("{op} input"))?;
        self.ensure_same_context(weights, &format!("{op} weights"))?;
        self.ensure_same_context(bias, &format!("{op} bias"))
    }

    /// Direct convolution (any kernel, stride, padding, groups).
    pub fn conv2d_tensor(
        &self,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &Conv2dConfig,
    ) -> Result<GpuTensor> {
        self.ensure_conv_inputs("conv2d", input, weights, bias, config)?;
        self.conv2d.execute(
            &self.context,
            &self.buffer_pool,
            input,
            weights,
            bias,
            config,
        )
    }

    pub fn depthwise_tensor(
        &self,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &Conv2dConfig,
    ) -> Result<GpuTensor> {
        self.ensure_conv_inputs("depthwise", input, weights, bias, config)?;
        self.depthwise.execute(
            &self.context,
            &self.buffer_pool,
            input,
            weights,
            bias,
            config,
        )
    }

    pub fn pointwise_tensor(
        &self,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &Conv2dConfig,
    ) -> Result<GpuTensor> {
        self.ensure_conv_inputs("pointwise", input, weights, bias, config)?;
        self.pointwise.execute(
            &self.context,
            &self.buffer_pool,
            input,
            weights,
            bias,
            config,
        )
    }

    pub fn relu6_tensor(&self, tensor: &GpuTensor) -> Result<GpuTensor> {
        self.ensure_same_context(tensor, "relu6")?;
        self.activation
            .execute(&self.context, &self.buffer_pool, tensor)
    }

    /// Element-wise `lhs + rhs`; shapes must match exactly.
    pub fn add_tensors(&self, lhs: &GpuTensor, rhs: &GpuTensor) -> Result<GpuTensor> {
        anyhow::ensure!(
            lhs.shape() == rhs.shape(),
            "add expects matching shapes (got {:?} and {:?})",
            lhs.shape().dims(),
            rhs.shape().dims()
        );
        self.ensure_same_context(lhs, "add lhs")?;
        self.ensure_same_context(rhs, "add rhs")?;
        self.add
            .execute(&self.context, &self.buffer_pool, lhs, rhs)
    }

    pub fn global_avg_pool_tensor(
        &self,
        tensor: &GpuTensor,
        config: &PoolConfig,
    ) -> Result<GpuTensor> {
        anyhow::ensure!(
            tensor.shape().dims() == config.input_shape_dims(),
            "global average pool expected {:?}, got {:?}",
            config.input_shape_dims(),
            tensor.shape().dims()
        );
        self.ensure_same_context(tensor, "global average pool")?;
        self.avg_pool
            .execute(&self.context, &self.buffer_pool, tensor, config)
    }

    pub fn linear_tensor(
        &self,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &LinearConfig,
    ) -> Result<GpuTensor> {
        config.validate(
            input.shape().elements(),
            weights.shape().elements(),
            bias.shape().elements(),
        )?;
        self.ensure_same_context(input, "linear input")?;
        self.ensure_same_context(weights, "linear weights")?;
        self.ensure_same_context(bias, "linear bias")?;
        self.linear.execute(
            &self.context,
            &self.buffer_pool,
            input,
            weights,
            bias,
            config,
        )
    }

    /// Convenience wrapper that uploads host slices, runs a convolution, and downloads the result.
    ///
    /// The kernel is picked from the geometry: depthwise, pointwise, or direct.
    pub fn conv2d_host(
        &self,
        input: &[f32],
        weights: &[f32],
        bias: &[f32],
        config: &Conv2dConfig,
    ) -> Result<Vec<f32>> {
        let input_tensor =
            self.upload_tensor(config.input_shape_dims(), input, Some("mobilenet_conv_input"))?;
        let weight_tensor = self.upload_tensor(
            config.weight_shape_dims(),
            weights,
            Some("mobilenet_conv_weights"),
        )?;
        let bias_tensor =
            self.upload_tensor(config.bias_shape_dims(), bias, Some("mobilenet_conv_bias"))?;
        let output = if config.is_depthwise() && config.kernel_width == config.kernel_height {
            self.depthwise_tensor(&input_tensor, &weight_tensor, &bias_tensor, config)?
        } else if config.is_pointwise() {
            self.pointwise_tensor(&input_tensor, &weight_tensor, &bias_tensor, config)?
        } else {
            self.conv2d_tensor(&input_tensor, &weight_tensor, &bias_tensor, config)?
        };
        output.to_vec()
    }

    /// Block until every submitted command has finished.
    pub fn synchronize(&self) -> Result<()> {
        self.context.synchronize()
    }
}

impl LayerKernels for GpuInferenceOps {
    type Tensor = GpuTensor;

    fn conv2d(
        &self,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &Conv2dConfig,
    ) -> Result<GpuTensor> {
        self.conv2d_tensor(input, weights, bias, config)
    }

    fn depthwise_conv2d(
        &self,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &Conv2dConfig,
    ) -> Result<GpuTensor> {
        self.depthwise_tensor(input, weights, bias, config)
    }

    fn pointwise_conv2d(
        &self,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &Conv2dConfig,
    ) -> Result<GpuTensor> {
        self.pointwise_tensor(input, weights, bias, config)
    }

    fn relu6(&self, tensor: &GpuTensor) -> Result<GpuTensor> {
        self.relu6_tensor(tensor)
    }

    fn add(&self, lhs: &GpuTensor, rhs: &GpuTensor) -> Result<GpuTensor> {
        self.add_tensors(lhs, rhs)
    }

    fn global_avg_pool(&self, tensor: &GpuTensor, config: &PoolConfig) -> Result<GpuTensor> {
        self.global_avg_pool_tensor(tensor, config)
    }

    fn linear(
        &self,
        input: &GpuTensor,
        weights: &GpuTensor,
        bias: &GpuTensor,
        config: &LinearConfig,
    ) -> Result<GpuTensor> {
        self.linear_tensor(input, weights, bias, config)
    }

    fn synchronize(&self) -> Result<()> {
        self.context.synchronize()
    }
}
