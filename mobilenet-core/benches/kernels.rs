use std::{hint::black_box, sync::Arc};

use criterion::{Criterion, criterion_group, criterion_main};
use mobilenet_core::{
    ActivationKind, Conv2dChannels, Conv2dConfig, GpuInferenceOps, LinearConfig, PoolConfig,
    SpatialDims, reference,
};
use mobilenet_utils::gpu::{GpuAvailability, GpuContext, GpuContextOptions};

fn setup_gpu() -> Option<Arc<GpuContext>> {
    match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
        GpuAvailability::Available(ctx) => Some(ctx),
        _ => None,
    }
}

fn pattern(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i % 100) as f32 / 100.0 - 0.5).collect()
}

/// Representative MobileNetV2 layers at 224x224.
fn layer_configs() -> Vec<(&'static str, Conv2dConfig)> {
    let relu6 = Some(ActivationKind::Relu6);
    vec![
        (
            "stem_conv",
            Conv2dConfig::standard(
                Conv2dChannels::new(3, 32),
                SpatialDims::square(224),
                3,
                2,
                relu6,
            ),
        ),
        (
            "block03_expand",
            Conv2dConfig::pointwise(Conv2dChannels::new(16, 96), SpatialDims::square(112), relu6),
        ),
        (
            "block03_depthwise",
            Conv2dConfig::depthwise(96, SpatialDims::square(112), 3, 2, relu6),
        ),
        (
            "block12_project",
            Conv2dConfig::pointwise(Conv2dChannels::new(384, 96), SpatialDims::square(14), None),
        ),
        (
            "block19_head",
            Conv2dConfig::pointwise(Conv2dChannels::new(320, 1280), SpatialDims::square(7), relu6),
        ),
    ]
    .into_iter()
    .map(|(name, config)| (name, config.expect("layer config")))
    .collect()
}

fn benchmark_conv_layers(c: &mut Criterion) {
    let gpu = setup_gpu().map(|ctx| GpuInferenceOps::new(ctx, None).expect("create ops"));
    if gpu.is_none() {
        eprintln!("Skipping GPU kernels (no adapter available); timing CPU only");
    }

    for (name, config) in layer_configs() {
        let input = pattern(config.input_shape_dims().iter().product());
        let weights = pattern(config.weight_shape_dims().iter().product());
        let bias = pattern(config.output_channels as usize);
        let mut group = c.benchmark_group(name);
        group.sample_size(20);

        group.bench_function("cpu", |b| {
            b.iter(|| {
                let out = if config.is_depthwise() {
                    reference::depthwise_conv2d(&input, &weights, &bias, &config)
                } else if config.is_pointwise() {
                    reference::pointwise_conv2d(&input, &weights, &bias, &config)
                } else {
                    reference::conv2d(&input, &weights, &bias, &config)
                };
                black_box(out.expect("cpu conv"));
            });
        });

        if let Some(ops) = &gpu {
            let input_gpu = ops
                .upload_tensor(config.input_shape_dims(), &input, Some("bench_input"))
                .expect("upload input");
            let weight_gpu = ops
                .upload_tensor(config.weight_shape_dims(), &weights, Some("bench_weights"))
                .expect("upload weights");
            let bias_gpu = ops
                .upload_tensor(config.bias_shape_dims(), &bias, Some("bench_bias"))
                .expect("upload bias");
            group.bench_function("gpu", |b| {
                b.iter(|| {
                    let output = if config.is_depthwise() {
                        ops.depthwise_tensor(&input_gpu, &weight_gpu, &bias_gpu, &config)
                    } else if config.is_pointwise() {
                        ops.pointwise_tensor(&input_gpu, &weight_gpu, &bias_gpu, &config)
                    } else {
                        ops.conv2d_tensor(&input_gpu, &weight_gpu, &bias_gpu, &config)
                    }
                    .expect("gpu conv");
                    ops.synchronize().expect("synchronize");
                    black_box(output);
                });
            });
        }
        group.finish();
    }
}

fn benchmark_classifier(c: &mut Criterion) {
    let pool = PoolConfig::new(1280, 7, 7).expect("pool config");
    let linear = LinearConfig::new(1280, 1000).expect("linear config");
    let features = pattern(1280 * 49);
    let weights = pattern(1000 * 1280);
    let bias = pattern(1000);

    let mut group = c.benchmark_group("classifier");
    group.bench_function("cpu", |b| {
        b.iter(|| {
            let pooled = reference::global_avg_pool(&features, &pool).expect("pool");
            black_box(reference::linear(&pooled, &weights, &bias, &linear).expect("linear"));
        });
    });

    if let Some(ctx) = setup_gpu() {
        let ops = GpuInferenceOps::new(ctx, None).expect("create ops");
        let features_gpu = ops
            .upload_tensor(pool.input_shape_dims(), &features, None)
            .expect("upload features");
        let weight_gpu = ops
            .upload_tensor(linear.weight_shape_dims(), &weights, None)
            .expect("upload weights");
        let bias_gpu = ops
            .upload_tensor(linear.bias_shape_dims(), &bias, None)
            .expect("upload bias");
        group.bench_function("gpu", |b| {
            b.iter(|| {
                let pooled = ops
                    .global_avg_pool_tensor(&features_gpu, &pool)
                    .expect("pool");
                let logits = ops
                    .linear_tensor(&pooled, &weight_gpu, &bias_gpu, &linear)
                    .expect("linear");
                ops.synchronize().expect("synchronize");
                black_box(logits);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_conv_layers, benchmark_classifier);
criterion_main!(benches);
