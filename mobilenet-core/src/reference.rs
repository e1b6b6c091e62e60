//! Multi-threaded CPU implementations of every layer.
//!
//! These serve as the correctness oracle for the WGSL kernels and as the
//! fallback backend when no adapter is available. Each kernel accumulates in
//! the same order as its shader counterpart (bias first for direct and
//! depthwise convolutions, bias last for pointwise and linear layers), so the
//! two backends differ only by fused multiply-add rounding.

use anyhow::Result;
use rayon::prelude::*;

use crate::layers::{
    ActivationKind, Conv2dConfig, LayerKernels, LinearConfig, PoolConfig, ShapedTensor,
};
use crate::tensor::HostTensor;

#[inline]
fn activate(value: f32, activation: Option<ActivationKind>) -> f32 {
    match activation {
        Some(kind) => kind.apply(value),
        None => value,
    }
}

/// Direct convolution with zero padding; handles grouped and depthwise layouts.
pub fn conv2d(
    input: &[f32],
    weights: &[f32],
    bias: &[f32],
    config: &Conv2dConfig,
) -> Result<Vec<f32>> {
    config.validate(input.len(), weights.len(), bias.len())?;
    let in_per_group = (config.input_channels / config.groups) as usize;
    let out_per_group = (config.output_channels / config.groups) as usize;
    let (iw, ih) = (config.input_width as usize, config.input_height as usize);
    let (ow, oh) = (config.output_width as usize, config.output_height as usize);
    let (kw, kh) = (config.kernel_width as usize, config.kernel_height as usize);
    let (sx, sy) = (config.stride_x as usize, config.stride_y as usize);
    let (px, py) = (config.pad_x as isize, config.pad_y as isize);
    let taps = kw * kh;
    let plane = iw * ih;

    let mut output = vec![0.0f32; config.output_element_count()];
    output
        .par_chunks_mut(ow * oh)
        .enumerate()
        .for_each(|(oc, out_plane)| {
            let ic_base = (oc / out_per_group) * in_per_group;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bias[oc];
                    for icg in 0..in_per_group {
                        let src = &input[(ic_base + icg) * plane..][..plane];
                        let filter = &weights[(oc * in_per_group + icg) * taps..][..taps];
                        for ky in 0..kh {
                            let iy = (oy * sy + ky) as isize - py;
                            if iy < 0 || iy >= ih as isize {
                                continue;
                            }
                            let src_row = &src[iy as usize * iw..][..iw];
                            for kx in 0..kw {
                                let ix = (ox * sx + kx) as isize - px;
                                if ix < 0 || ix >= iw as isize {
                                    continue;
                                }
                                acc += src_row[ix as usize] * filter[ky * kw + kx];
                            }
                        }
                    }
                    out_plane[oy * ow + ox] = activate(acc, config.activation);
                }
            }
        });
    Ok(output)
}

/// Per-channel convolution; rejects configs that are not depthwise.
pub fn depthwise_conv2d(
    input: &[f32],
    weights: &[f32],
    bias: &[f32],
    config: &Conv2dConfig,
) -> Result<Vec<f32>> {
    anyhow::ensure!(
        config.is_depthwise(),
        "depthwise convolution needs groups == channels (got {} groups for {} channels)",
        config.groups,
        config.input_channels
    );
    conv2d(input, weights, bias, config)
}

/// 1x1 convolution as `W[Cout, Cin] x X[Cin, HW] + b`.
pub fn pointwise_conv2d(
    input: &[f32],
    weights: &[f32],
    bias: &[f32],
    config: &Conv2dConfig,
) -> Result<Vec<f32>> {
    anyhow::ensure!(
        config.is_pointwise(),
        "pointwise convolution needs a 1x1, stride 1, unpadded, ungrouped config"
    );
    config.validate(input.len(), weights.len(), bias.len())?;
    let cin = config.input_channels as usize;
    let pixels = (config.input_width * config.input_height) as usize;

    let mut output = vec![0.0f32; config.output_element_count()];
    output
        .par_chunks_mut(pixels)
        .enumerate()
        .for_each(|(co, row)| {
            let filter = &weights[co * cin..][..cin];
            for (ci, &w) in filter.iter().enumerate() {
                let src = &input[ci * pixels..][..pixels];
                for (dst, &x) in row.iter_mut().zip(src) {
                    *dst += w * x;
                }
            }
            let b = bias[co];
            for value in row.iter_mut() {
                *value = activate(*value + b, config.activation);
            }
        });
    Ok(output)
}

pub fn relu6(input: &[f32]) -> Vec<f32> {
    input
        .par_iter()
        .map(|&value| ActivationKind::Relu6.apply(value))
        .collect()
}

pub fn add(lhs: &[f32], rhs: &[f32]) -> Result<Vec<f32>> {
    anyhow::ensure!(
        lhs.len() == rhs.len(),
        "add expects equal lengths (got {} and {})",
        lhs.len(),
        rhs.len()
    );
    Ok(lhs.par_iter().zip(rhs).map(|(a, b)| a + b).collect())
}

/// Mean over each channel plane: the sum is divided once at the end.
pub fn global_avg_pool(input: &[f32], config: &PoolConfig) -> Result<Vec<f32>> {
    let plane = config.spatial_elements();
    let expected = config.channels as usize * plane;
    anyhow::ensure!(
        input.len() == expected,
        "global average pool expected {expected} elements, got {}",
        input.len()
    );
    Ok(input
        .par_chunks(plane)
        .map(|channel| channel.iter().sum::<f32>() / plane as f32)
        .collect())
}

pub fn linear(
    input: &[f32],
    weights: &[f32],
    bias: &[f32],
    config: &LinearConfig,
) -> Result<Vec<f32>> {
    config.validate(input.len(), weights.len(), bias.len())?;
    let in_features = config.in_features as usize;
    Ok(weights
        .par_chunks(in_features)
        .zip(bias.par_iter())
        .map(|(row, &b)| {
            let mut acc = 0.0f32;
            for (w, x) in row.iter().zip(input) {
                acc += w * x;
            }
            acc + b
        })
        .collect())
}

/// [`LayerKernels`] over host tensors.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuKernels;

impl LayerKernels for CpuKernels {
    type Tensor = HostTensor;

    fn conv2d(
        &self,
        input: &HostTensor,
        weights: &HostTensor,
        bias: &HostTensor,
        config: &Conv2dConfig,
    ) -> Result<HostTensor> {
        let data = conv2d(input.data(), weights.data(), bias.data(), config)?;
        HostTensor::new(config.output_shape_dims(), data)
    }

    fn depthwise_conv2d(
        &self,
        input: &HostTensor,
        weights: &HostTensor,
        bias: &HostTensor,
        config: &Conv2dConfig,
    ) -> Result<HostTensor> {
        let data = depthwise_conv2d(input.data(), weights.data(), bias.data(), config)?;
        HostTensor::new(config.output_shape_dims(), data)
    }

    fn pointwise_conv2d(
        &self,
        input: &HostTensor,
        weights: &HostTensor,
        bias: &HostTensor,
        config: &Conv2dConfig,
    ) -> Result<HostTensor> {
        let data = pointwise_conv2d(input.data(), weights.data(), bias.data(), config)?;
        HostTensor::new(config.output_shape_dims(), data)
    }

    fn relu6(&self, tensor: &HostTensor) -> Result<HostTensor> {
        HostTensor::new(tensor.dims().to_vec(), relu6(tensor.data()))
    }

    fn add(&self, lhs: &HostTensor, rhs: &HostTensor) -> Result<HostTensor> {
        anyhow::ensure!(
            lhs.dims() == rhs.dims(),
            "add expects matching shapes (got {:?} and {:?})",
            lhs.dims(),
            rhs.dims()
        );
        HostTensor::new(lhs.dims().to_vec(), add(lhs.data(), rhs.data())?)
    }

    fn global_avg_pool(&self, tensor: &HostTensor, config: &PoolConfig) -> Result<HostTensor> {
        anyhow::ensure!(
            tensor.dims() == config.input_shape_dims(),
            "global average pool expected {:?}, got {:?}",
            config.input_shape_dims(),
            tensor.dims()
        );
        let data = global_avg_pool(tensor.data(), config)?;
        HostTensor::new(config.output_shape_dims(), data)
    }

    fn linear(
        &self,
        input: &HostTensor,
        weights: &HostTensor,
        bias: &HostTensor,
        config: &LinearConfig,
    ) -> Result<HostTensor> {
        let data = linear(input.data(), weights.data(), bias.data(), config)?;
        HostTensor::new(config.output_shape_dims(), data)
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}
