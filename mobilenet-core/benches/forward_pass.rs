use std::{hint::black_box, sync::Arc};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use mobilenet_core::{
    CpuMobileNet, GpuMobileNet, InferenceBackend, MOBILENET_V2_BLOCKS, NetworkPlan, PlanOptions,
    WeightSet,
};
use mobilenet_utils::{
    InputDimensions,
    gpu::{GpuAvailability, GpuContext, GpuContextOptions},
};

fn plan(fuse_activations: bool) -> NetworkPlan {
    NetworkPlan::new(
        &MOBILENET_V2_BLOCKS,
        InputDimensions::default(),
        PlanOptions { fuse_activations },
    )
    .expect("plan")
}

/// Small deterministic weights; timing does not depend on the values.
fn weights(plan: &NetworkPlan) -> WeightSet {
    WeightSet::from_fn(plan, |spec| {
        let len: usize = spec.dims.iter().product();
        (0..len).map(|i| ((i % 17) as f32 - 8.0) * 1e-3).collect()
    })
    .expect("weights")
}

fn benchmark_forward_pass(c: &mut Criterion) {
    let input: Vec<f32> = (0..InputDimensions::default().elements())
        .map(|i| (i % 255) as f32 / 255.0)
        .collect();
    let mut group = c.benchmark_group("mobilenet_v2_224");
    group.sample_size(10);

    let context = match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
        GpuAvailability::Available(ctx) => Some(ctx),
        _ => {
            eprintln!("Skipping GPU forward pass (no adapter available)");
            None
        }
    };

    for fuse in [true, false] {
        let plan = plan(fuse);
        let weights = weights(&plan);
        let variant = if fuse { "fused" } else { "unfused" };

        if let Some(ctx) = &context {
            let model = GpuMobileNet::new(ctx.clone(), &weights, plan.clone(), None)
                .expect("gpu model");
            group.bench_with_input(BenchmarkId::new("gpu", variant), &input, |b, input| {
                b.iter(|| black_box(model.infer(input).expect("gpu pass")));
            });
        }

        let model = CpuMobileNet::new(Arc::new(weights), plan).expect("cpu model");
        group.bench_with_input(BenchmarkId::new("cpu", variant), &input, |b, input| {
            b.iter(|| black_box(model.infer(input).expect("cpu pass")));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_forward_pass);
criterion_main!(benches);
