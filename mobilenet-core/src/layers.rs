//! Layer geometry shared by the GPU kernels, the CPU reference kernels, and
//! the network plan.
//!
//! Tensors are flat `f32` buffers in NCHW order with batch size 1. A
//! convolution weight for output channel `oc`, input channel `ic`, tap
//! `(ky, kx)` lives at `((oc * in_per_group + ic) * kh + ky) * kw + kx`.

use anyhow::{Context, Result};

/// Activation that can be fused into a convolution or run as its own layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// `min(max(x, 0), 6)`.
    Relu6,
}

impl ActivationKind {
    /// Clamp bounds applied by the activation.
    pub const fn bounds(self) -> (f32, f32) {
        match self {
            ActivationKind::Relu6 => (0.0, 6.0),
        }
    }

    #[inline]
    pub fn apply(self, value: f32) -> f32 {
        let (low, high) = self.bounds();
        value.max(low).min(high)
    }
}

/// Uniform-buffer encoding of an optional fused activation.
pub(crate) fn activation_mode(activation: Option<ActivationKind>) -> u32 {
    match activation {
        None => 0,
        Some(ActivationKind::Relu6) => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dChannels {
    pub input: u32,
    pub output: u32,
}

impl Conv2dChannels {
    pub const fn new(input: u32, output: u32) -> Self {
        Self { input, output }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialDims {
    pub width: u32,
    pub height: u32,
}

impl SpatialDims {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(size: u32) -> Self {
        Self::new(size, size)
    }
}

impl From<(u32, u32)> for SpatialDims {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dOptions {
    pub groups: u32,
    pub activation: Option<ActivationKind>,
}

impl Conv2dOptions {
    pub const fn new(groups: u32, activation: Option<ActivationKind>) -> Self {
        Self { groups, activation }
    }
}

/// Geometry for a convolution layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub input_channels: u32,
    pub output_channels: u32,
    pub input_width: u32,
    pub input_height: u32,
    pub kernel_width: u32,
    pub kernel_height: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub groups: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub activation: Option<ActivationKind>,
}

impl Conv2dConfig {
    /// Create a validated convolution configuration.
    pub fn new(
        channels: Conv2dChannels,
        input: SpatialDims,
        kernel: SpatialDims,
        stride: SpatialDims,
        pad: SpatialDims,
        options: Conv2dOptions,
    ) -> Result<Self> {
        let Conv2dOptions { groups, activation } = options;
        let Conv2dChannels {
            input: input_channels,
            output: output_channels,
        } = channels;
        let SpatialDims {
            width: input_width,
            height: input_height,
        } = input;
        let SpatialDims {
            width: kernel_width,
            height: kernel_height,
        } = kernel;
        let SpatialDims {
            width: stride_x,
            height: stride_y,
        } = stride;
        let SpatialDims {
            width: pad_x,
            height: pad_y,
        } = pad;
        anyhow::ensure!(input_channels > 0, "input channels must be > 0");
        anyhow::ensure!(output_channels > 0, "output channels must be > 0");
        anyhow::ensure!(
            input_width > 0 && input_height > 0,
            "input spatial size must be non-zero"
        );
        anyhow::ensure!(
            kernel_width > 0 && kernel_height > 0,
            "kernel must be non-zero"
        );
        anyhow::ensure!(stride_x > 0 && stride_y > 0, "stride must be non-zero");
        anyhow::ensure!(groups > 0, "groups must be > 0");
        anyhow::ensure!(
            input_channels.is_multiple_of(groups),
            "input channels ({input_channels}) must be divisible by groups ({groups})"
        );
        anyhow::ensure!(
            output_channels.is_multiple_of(groups),
            "output channels ({output_channels}) must be divisible by groups ({groups})"
        );

        let output_width = compute_output_dim(input_width, pad_x, kernel_width, stride_x)
            .context("invalid convolution width configuration")?;
        let output_height = compute_output_dim(input_height, pad_y, kernel_height, stride_y)
            .context("invalid convolution height configuration")?;

        Ok(Self {
            input_channels,
            output_channels,
            input_width,
            input_height,
            kernel_width,
            kernel_height,
            stride_x,
            stride_y,
            pad_x,
            pad_y,
            groups,
            output_width,
            output_height,
            activation,
        })
    }

    /// Square-kernel convolution with "same"-style padding of `kernel / 2`.
    pub fn standard(
        channels: Conv2dChannels,
        input: SpatialDims,
        kernel: u32,
        stride: u32,
        activation: Option<ActivationKind>,
    ) -> Result<Self> {
        Self::new(
            channels,
            input,
            SpatialDims::square(kernel),
            SpatialDims::square(stride),
            SpatialDims::square(kernel / 2),
            Conv2dOptions::new(1, activation),
        )
    }

    /// One filter per channel (`groups == channels`).
    pub fn depthwise(
        channels: u32,
        input: SpatialDims,
        kernel: u32,
        stride: u32,
        activation: Option<ActivationKind>,
    ) -> Result<Self> {
        Self::new(
            Conv2dChannels::new(channels, channels),
            input,
            SpatialDims::square(kernel),
            SpatialDims::square(stride),
            SpatialDims::square(kernel / 2),
            Conv2dOptions::new(channels, activation),
        )
    }

    /// 1x1 convolution with unit stride and no padding.
    pub fn pointwise(
        channels: Conv2dChannels,
        input: SpatialDims,
        activation: Option<ActivationKind>,
    ) -> Result<Self> {
        Self::new(
            channels,
            input,
            SpatialDims::square(1),
            SpatialDims::square(1),
            SpatialDims::square(0),
            Conv2dOptions::new(1, activation),
        )
    }

    pub fn is_depthwise(&self) -> bool {
        self.groups == self.input_channels && self.groups == self.output_channels
    }

    pub fn is_pointwise(&self) -> bool {
        self.kernel_width == 1
            && self.kernel_height == 1
            && self.stride_x == 1
            && self.stride_y == 1
            && self.pad_x == 0
            && self.pad_y == 0
            && self.groups == 1
    }

    pub fn input_spatial(&self) -> SpatialDims {
        SpatialDims::new(self.input_width, self.input_height)
    }

    pub fn output_spatial(&self) -> SpatialDims {
        SpatialDims::new(self.output_width, self.output_height)
    }

    pub fn input_shape_dims(&self) -> [usize; 4] {
        [
            1,
            self.input_channels as usize,
            self.input_height as usize,
            self.input_width as usize,
        ]
    }

    pub fn output_shape_dims(&self) -> [usize; 4] {
        [
            1,
            self.output_channels as usize,
            self.output_height as usize,
            self.output_width as usize,
        ]
    }

    pub fn weight_shape_dims(&self) -> [usize; 4] {
        [
            self.output_channels as usize,
            (self.input_channels / self.groups) as usize,
            self.kernel_height as usize,
            self.kernel_width as usize,
        ]
    }

    pub fn bias_shape_dims(&self) -> [usize; 1] {
        [self.output_channels as usize]
    }

    pub fn validate(&self, input_len: usize, weight_len: usize, bias_len: usize) -> Result<()> {
        let expected_input: usize = self.input_shape_dims().iter().product();
        anyhow::ensure!(
            input_len == expected_input,
            "conv input tensor expected {expected_input} elements, got {input_len}"
        );
        let expected_weights: usize = self.weight_shape_dims().iter().product();
        anyhow::ensure!(
            weight_len == expected_weights,
            "conv weights expected {expected_weights} elements, got {weight_len}"
        );
        anyhow::ensure!(
            bias_len == self.output_channels as usize,
            "conv bias expected {} elements, got {bias_len}",
            self.output_channels
        );
        Ok(())
    }

    pub fn output_element_count(&self) -> usize {
        self.output_shape_dims().iter().product()
    }
}

/// Global average pooling over an NCHW tensor, producing `[1, C]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
}

impl PoolConfig {
    pub fn new(channels: u32, height: u32, width: u32) -> Result<Self> {
        anyhow::ensure!(
            channels > 0 && height > 0 && width > 0,
            "pool input must be non-empty (got {channels}x{height}x{width})"
        );
        Ok(Self {
            channels,
            height,
            width,
        })
    }

    /// Build a config from the dims of an NCHW tensor.
    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        anyhow::ensure!(
            dims.len() == 4 && dims[0] == 1,
            "global average pool expects a [1, C, H, W] tensor (got {dims:?})"
        );
        let to_u32 = |value: usize| u32::try_from(value).context("pool dimension exceeds u32");
        Self::new(to_u32(dims[1])?, to_u32(dims[2])?, to_u32(dims[3])?)
    }

    pub fn spatial_elements(&self) -> usize {
        self.height as usize * self.width as usize
    }

    pub fn input_shape_dims(&self) -> [usize; 4] {
        [
            1,
            self.channels as usize,
            self.height as usize,
            self.width as usize,
        ]
    }

    pub fn output_shape_dims(&self) -> [usize; 2] {
        [1, self.channels as usize]
    }
}

/// Fully connected layer `y = W x + b` with `W` stored `[out, in]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    pub in_features: u32,
    pub out_features: u32,
}

impl LinearConfig {
    pub fn new(in_features: u32, out_features: u32) -> Result<Self> {
        anyhow::ensure!(
            in_features > 0 && out_features > 0,
            "linear layer features must be non-zero (got {in_features} -> {out_features})"
        );
        Ok(Self {
            in_features,
            out_features,
        })
    }

    pub fn input_shape_dims(&self) -> [usize; 2] {
        [1, self.in_features as usize]
    }

    pub fn output_shape_dims(&self) -> [usize; 2] {
        [1, self.out_features as usize]
    }

    pub fn weight_shape_dims(&self) -> [usize; 2] {
        [self.out_features as usize, self.in_features as usize]
    }

    pub fn bias_shape_dims(&self) -> [usize; 1] {
        [self.out_features as usize]
    }

    pub fn validate(&self, input_len: usize, weight_len: usize, bias_len: usize) -> Result<()> {
        anyhow::ensure!(
            input_len == self.in_features as usize,
            "linear input expected {} elements, got {input_len}",
            self.in_features
        );
        let expected_weights = self.in_features as usize * self.out_features as usize;
        anyhow::ensure!(
            weight_len == expected_weights,
            "linear weights expected {expected_weights} elements, got {weight_len}"
        );
        anyhow::ensure!(
            bias_len == self.out_features as usize,
            "linear bias expected {} elements, got {bias_len}",
            self.out_features
        );
        Ok(())
    }
}

/// `floor((size + 2 * pad - kernel) / stride) + 1`.
pub fn compute_output_dim(size: u32, pad: u32, kernel: u32, stride: u32) -> Result<u32> {
    anyhow::ensure!(stride > 0, "stride must be > 0");
    anyhow::ensure!(kernel > 0, "kernel must be > 0");
    let padded = pad
        .checked_mul(2)
        .and_then(|total| size.checked_add(total))
        .context("padding overflowed u32")?;
    let numerator = padded
        .checked_sub(kernel)
        .context("kernel larger than padded input")?;
    Ok(numerator / stride + 1)
}

/// Anything with an NCHW (or `[1, C]`) shape.
pub trait ShapedTensor {
    fn dims(&self) -> &[usize];

    fn elements(&self) -> usize {
        self.dims().iter().product()
    }
}

/// The primitive layer set a backend must provide to run a network plan.
///
/// Every method returns a new tensor; inputs are never modified, so the
/// executor can keep a handle to a block input for the residual add.
pub trait LayerKernels {
    type Tensor: ShapedTensor + Clone;

    fn conv2d(
        &self,
        input: &Self::Tensor,
        weights: &Self::Tensor,
        bias: &Self::Tensor,
        config: &Conv2dConfig,
    ) -> Result<Self::Tensor>;

    fn depthwise_conv2d(
        &self,
        input: &Self::Tensor,
        weights: &Self::Tensor,
        bias: &Self::Tensor,
        config: &Conv2dConfig,
    ) -> Result<Self::Tensor>;

    fn pointwise_conv2d(
        &self,
        input: &Self::Tensor,
        weights: &Self::Tensor,
        bias: &Self::Tensor,
        config: &Conv2dConfig,
    ) -> Result<Self::Tensor>;

    fn relu6(&self, tensor: &Self::Tensor) -> Result<Self::Tensor>;

    fn add(&self, lhs: &Self::Tensor, rhs: &Self::Tensor) -> Result<Self::Tensor>;

    fn global_avg_pool(&self, tensor: &Self::Tensor, config: &PoolConfig)
    -> Result<Self::Tensor>;

    fn linear(
        &self,
        input: &Self::Tensor,
        weights: &Self::Tensor,
        bias: &Self::Tensor,
        config: &LinearConfig,
    ) -> Result<Self::Tensor>;

    /// Block until all previously issued work has completed.
    fn synchronize(&self) -> Result<()>;
}

/// Named parameter lookup for a backend's tensor type.
pub trait WeightProvider<T> {
    fn tensor(&self, name: &str) -> Result<&T>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dim_matches_floor_formula() {
        assert_eq!(compute_output_dim(224, 1, 3, 2).unwrap(), 112);
        assert_eq!(compute_output_dim(7, 1, 3, 2).unwrap(), 4);
        assert_eq!(compute_output_dim(1, 1, 3, 2).unwrap(), 1);
        assert_eq!(compute_output_dim(56, 0, 1, 1).unwrap(), 56);
        assert!(compute_output_dim(1, 0, 3, 1).is_err());
    }

    #[test]
    fn depthwise_and_pointwise_helpers_set_geometry() {
        let dw = Conv2dConfig::depthwise(96, SpatialDims::square(56), 3, 2, None).unwrap();
        assert!(dw.is_depthwise());
        assert_eq!(dw.output_shape_dims(), [1, 96, 28, 28]);
        assert_eq!(dw.weight_shape_dims(), [96, 1, 3, 3]);

        let pw = Conv2dConfig::pointwise(
            Conv2dChannels::new(16, 96),
            SpatialDims::square(56),
            Some(ActivationKind::Relu6),
        )
        .unwrap();
        assert!(pw.is_pointwise());
        assert!(!pw.is_depthwise());
        assert_eq!(pw.output_shape_dims(), [1, 96, 56, 56]);
        assert_eq!(pw.weight_shape_dims(), [96, 16, 1, 1]);
    }

    #[test]
    fn grouped_channel_mismatch_is_rejected() {
        let err = Conv2dConfig::new(
            Conv2dChannels::new(6, 4),
            SpatialDims::square(8),
            SpatialDims::square(3),
            SpatialDims::square(1),
            SpatialDims::square(1),
            Conv2dOptions::new(4, None),
        )
        .unwrap_err();
        assert!(err.to_string().contains("divisible by groups"));
    }

    #[test]
    fn conv_validate_checks_lengths() {
        let cfg = Conv2dConfig::standard(
            Conv2dChannels::new(3, 8),
            SpatialDims::new(10, 6),
            3,
            1,
            None,
        )
        .unwrap();
        cfg.validate(3 * 6 * 10, 8 * 3 * 9, 8).unwrap();
        assert!(cfg.validate(3 * 6 * 10, 8 * 3 * 9, 7).is_err());
        assert!(cfg.validate(3 * 6 * 9, 8 * 3 * 9, 8).is_err());
    }

    #[test]
    fn relu6_clamps_both_ends() {
        let act = ActivationKind::Relu6;
        assert_eq!(act.apply(-3.0), 0.0);
        assert_eq!(act.apply(2.5), 2.5);
        assert_eq!(act.apply(6.0), 6.0);
        assert_eq!(act.apply(9.0), 6.0);
    }

    #[test]
    fn pool_config_requires_single_batch_nchw() {
        let cfg = PoolConfig::from_dims(&[1, 1280, 7, 7]).unwrap();
        assert_eq!(cfg.spatial_elements(), 49);
        assert_eq!(cfg.output_shape_dims(), [1, 1280]);
        assert!(PoolConfig::from_dims(&[2, 4, 4, 4]).is_err());
        assert!(PoolConfig::from_dims(&[1, 1280]).is_err());
    }
}
