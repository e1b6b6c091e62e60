//! Shared fixtures for the forward-pass integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use mobilenet_core::{MOBILENET_V2_BLOCKS, NetworkPlan, PlanOptions, WeightSet, WeightSpec};
use mobilenet_utils::gpu::{GpuAvailability, GpuContext, GpuContextOptions};
use mobilenet_utils::InputDimensions;

/// Constant value of every input pixel in the hand-computable fixture.
pub const FIXTURE_INPUT: f32 = 0.25;

pub fn plan(size: u32, fuse_activations: bool) -> NetworkPlan {
    NetworkPlan::new(
        &MOBILENET_V2_BLOCKS,
        InputDimensions {
            channels: 3,
            height: size,
            width: size,
        },
        PlanOptions { fuse_activations },
    )
    .expect("plan")
}

pub fn gpu_context() -> Option<Arc<GpuContext>> {
    match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
        GpuAvailability::Available(ctx) => Some(ctx),
        other => {
            eprintln!("Skipping GPU test: {other:?}");
            None
        }
    }
}

/// Weights whose forward pass can be followed by hand.
///
/// Every convolution routes one input channel to each output channel
/// (`W[oc, oc % cin, centre] = 1`), so a constant image stays constant
/// per block and only the ReLU6 clamps and residual adds change its value.
/// The classifier averages with weight `1/1024` and adds `0.001 * k`.
pub fn fixture_weights(plan: &NetworkPlan) -> WeightSet {
    WeightSet::from_fn(plan, fixture_values).expect("fixture weights")
}

fn fixture_values(spec: &WeightSpec) -> Vec<f32> {
    let len: usize = spec.dims.iter().product();
    let classifier = spec.name.contains("classifier");
    if spec.name.ends_with(".bias") {
        return if classifier {
            (0..len).map(|k| 0.001 * k as f32).collect()
        } else {
            vec![0.0; len]
        };
    }
    if classifier {
        return vec![1.0 / 1024.0; len];
    }

    let [out_channels, in_per_group, kh, kw] = spec.dims[..] else {
        panic!("unexpected weight rank for {}", spec.name);
    };
    let taps = kh * kw;
    let centre = (kh / 2) * kw + kw / 2;
    let mut values = vec![0.0; len];
    for oc in 0..out_channels {
        let ic = oc % in_per_group;
        values[(oc * in_per_group + ic) * taps + centre] = 1.0;
    }
    values
}

/// Value each block's output takes under [`fixture_weights`], blocks 1 to 19.
pub const FIXTURE_BLOCK_VALUES: [f32; 19] = [
    0.25, 0.25, 0.25, 0.5, 0.5, 1.0, 2.0, 2.0, 4.0, 8.0, 14.0, 6.0, 12.0, 18.0, 6.0, 12.0, 18.0,
    6.0, 6.0,
];

/// Logits the fixture must produce: `1280 * 6 / 1024 + 0.001 * k`.
pub fn fixture_logits(classes: usize) -> Vec<f32> {
    (0..classes).map(|k| 7.5 + 0.001 * k as f32).collect()
}

/// Deterministic pseudo-random generator for weights and inputs.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1))
    }

    /// Uniform value in `[-1, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((self.0 >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }

    pub fn vec(&mut self, len: usize, scale: f32) -> Vec<f32> {
        (0..len).map(|_| self.next_f32() * scale).collect()
    }
}

/// Random weights scaled by `1/sqrt(fan_in)` so activations stay in range.
pub fn random_weights(plan: &NetworkPlan, seed: u64) -> WeightSet {
    let mut rng = Lcg::new(seed);
    WeightSet::from_fn(plan, |spec| {
        let len: usize = spec.dims.iter().product();
        let fan_in: usize = spec.dims.iter().skip(1).product::<usize>().max(1);
        let scale = if spec.name.ends_with(".bias") {
            0.1
        } else {
            1.5 / (fan_in as f32).sqrt()
        };
        rng.vec(len, scale)
    })
    .expect("random weights")
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "length mismatch");
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}
