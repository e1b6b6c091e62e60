//! Random-weight forward passes across backends and plan variants.

mod common;

use std::sync::Arc;

use common::{Lcg, gpu_context, max_abs_diff, plan, random_weights};
use mobilenet_core::{CpuMobileNet, GpuMobileNet, InferenceBackend};

const SIZE: u32 = 32;

fn input(seed: u64) -> Vec<f32> {
    Lcg::new(seed).vec(3 * (SIZE * SIZE) as usize, 1.0)
}

#[test]
fn fused_and_unfused_cpu_plans_agree_exactly() {
    let fused = plan(SIZE, true);
    let unfused = plan(SIZE, false);
    let weights = Arc::new(random_weights(&fused, 11));
    let image = input(12);

    let a = CpuMobileNet::new(weights.clone(), fused)
        .expect("fused")
        .infer(&image)
        .expect("fused pass");
    let b = CpuMobileNet::new(weights, unfused)
        .expect("unfused")
        .infer(&image)
        .expect("unfused pass");
    assert_eq!(a, b);
    assert!(a.iter().all(|value| value.is_finite()));
}

#[test]
fn gpu_logits_match_cpu_reference() {
    let Some(ctx) = gpu_context() else {
        return;
    };
    for fuse in [true, false] {
        let plan = plan(SIZE, fuse);
        let weights = random_weights(&plan, 21);
        let image = input(22);

        let cpu = CpuMobileNet::new(Arc::new(weights.clone()), plan.clone())
            .expect("cpu")
            .infer(&image)
            .expect("cpu pass");
        let gpu = GpuMobileNet::new(ctx.clone(), &weights, plan, None)
            .expect("gpu")
            .infer(&image)
            .expect("gpu pass");

        let scale = cpu.iter().fold(1.0f32, |acc, v| acc.max(v.abs()));
        let diff = max_abs_diff(&gpu, &cpu);
        assert!(diff <= 1e-3 * scale, "fuse={fuse}: max diff {diff} (scale {scale})");
    }
}

#[test]
fn repeated_passes_are_bit_identical() {
    let plan = plan(SIZE, true);
    let weights = random_weights(&plan, 31);
    let image = input(32);

    let cpu = CpuMobileNet::new(Arc::new(weights.clone()), plan.clone()).expect("cpu");
    let first = cpu.infer(&image).expect("cpu pass");
    for _ in 0..3 {
        assert_eq!(cpu.infer(&image).expect("cpu pass"), first);
    }

    let Some(ctx) = gpu_context() else {
        return;
    };
    let gpu = GpuMobileNet::new(ctx, &weights, plan, None).expect("gpu");
    let first = gpu.infer(&image).expect("gpu pass");
    for _ in 0..3 {
        assert_eq!(gpu.infer(&image).expect("gpu pass"), first);
    }
    // The input tensor is reused, so a different image must not see stale data.
    let other = gpu.infer(&input(33)).expect("gpu pass");
    assert_ne!(other, first);
}

#[test]
fn gpu_memory_limit_too_small_fails_cleanly() {
    let Some(ctx) = gpu_context() else {
        return;
    };
    let plan = plan(SIZE, true);
    let weights = random_weights(&plan, 41);
    let err = GpuMobileNet::new(ctx, &weights, plan, Some(64 * 1024)).expect_err("limit");
    assert!(format!("{err:#}").contains("limit"), "{err:#}");
}
