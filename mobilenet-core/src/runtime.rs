//! Ready-to-run forward passes over a fixed plan and weight set.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::{debug, info};
use mobilenet_utils::gpu::GpuContext;

use crate::gpu::{GpuInferenceOps, GpuTensor};
use crate::layers::WeightProvider;
use crate::pipeline::execute_plan;
use crate::plan::NetworkPlan;
use crate::reference::CpuKernels;
use crate::tensor::HostTensor;
use crate::weights::WeightSet;

/// One way of turning an input image into logits.
pub trait InferenceBackend {
    /// Human-readable description for logs and reports.
    fn label(&self) -> String;

    /// Run one forward pass on a flattened `C×H×W` image.
    fn infer(&self, input: &[f32]) -> Result<Vec<f32>>;

    /// Block until all work issued so far has completed.
    fn synchronize(&self) -> Result<()>;

    /// Run one pass under a [`PassTimer`] and append its latency to `samples`.
    fn timed_infer(&self, input: &[f32], samples: &mut Vec<Duration>) -> Result<Vec<f32>> {
        let timer = PassTimer::start(samples);
        let output = self.infer(input)?;
        self.synchronize()?;
        timer.stop();
        Ok(output)
    }
}

/// Scoped wall-clock timer for one forward pass.
///
/// The elapsed time is recorded exactly once, either by [`PassTimer::stop`]
/// or when the timer drops on an error path.
pub struct PassTimer<'a> {
    samples: &'a mut Vec<Duration>,
    start: Instant,
    recorded: bool,
}

impl<'a> PassTimer<'a> {
    pub fn start(samples: &'a mut Vec<Duration>) -> Self {
        Self {
            samples,
            start: Instant::now(),
            recorded: false,
        }
    }

    /// Record and return the elapsed time.
    pub fn stop(mut self) -> Duration {
        self.record()
    }

    fn record(&mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if !self.recorded {
            self.samples.push(elapsed);
            self.recorded = true;
        }
        elapsed
    }
}

impl Drop for PassTimer<'_> {
    fn drop(&mut self) {
        self.record();
    }
}

fn ensure_input_len(plan: &NetworkPlan, input: &[f32]) -> Result<()> {
    let expected = plan.input().elements();
    anyhow::ensure!(
        input.len() == expected,
        "input has {} values, expected {expected} ({:?})",
        input.len(),
        plan.input_dims()
    );
    Ok(())
}

/// Parameter tensors resident on the GPU.
#[derive(Debug)]
pub struct GpuWeights {
    tensors: HashMap<String, GpuTensor>,
}

impl GpuWeights {
    /// Upload the tensors `plan` uses; anything else in `weights` stays on the host.
    pub fn upload(ops: &GpuInferenceOps, weights: &WeightSet, plan: &NetworkPlan) -> Result<Self> {
        weights.validate_for(plan)?;
        let mut tensors = HashMap::with_capacity(plan.weight_specs().len());
        for spec in plan.weight_specs() {
            let host = weights.tensor(&spec.name)?;
            let tensor = ops
                .upload_tensor(
                    spec.dims.clone(),
                    host.data(),
                    Some(&format!("weight::{}", spec.name)),
                )
                .with_context(|| format!("failed to upload weight '{}'", spec.name))?;
            tensors.insert(spec.name.clone(), tensor);
        }
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightProvider<GpuTensor> for GpuWeights {
    fn tensor(&self, name: &str) -> Result<&GpuTensor> {
        self.tensors
            .get(name)
            .with_context(|| format!("gpu weight '{name}' missing"))
    }
}

#[derive(Debug, Default)]
struct GpuMobileNetWorkspace {
    input_tensors: Vec<GpuTensor>,
}

/// MobileNetV2 running on the WGSL kernels.
///
/// Weights are uploaded once; the input tensor is reused across passes so
/// the timed loop only writes the image and reads back the logits.
#[derive(Debug)]
pub struct GpuMobileNet {
    ops: Arc<GpuInferenceOps>,
    weights: GpuWeights,
    plan: NetworkPlan,
    profile_stages: bool,
    workspace: Mutex<GpuMobileNetWorkspace>,
}

impl GpuMobileNet {
    pub fn new(
        context: Arc<GpuContext>,
        weights: &WeightSet,
        plan: NetworkPlan,
        memory_limit: Option<u64>,
    ) -> Result<Self> {
        let estimate = estimate_inference_memory(&plan);
        match memory_limit {
            Some(limit) => info!(
                target: "mobilenet::gpu",
                "estimated GPU footprint {} MiB (limit {} MiB)",
                estimate / (1024 * 1024),
                limit / (1024 * 1024)
            ),
            None => debug!(
                target: "mobilenet::gpu",
                "estimated GPU footprint {} MiB (no limit)",
                estimate / (1024 * 1024)
            ),
        }
        let ops = Arc::new(GpuInferenceOps::new(context, memory_limit)?);
        let weights = GpuWeights::upload(&ops, weights, &plan)?;
        debug!(
            target: "mobilenet::gpu",
            "uploaded {} weight tensors ({} bytes)",
            weights.len(),
            plan.weight_bytes()
        );
        Ok(Self {
            ops,
            weights,
            plan,
            profile_stages: false,
            workspace: Mutex::new(GpuMobileNetWorkspace::default()),
        })
    }

    /// Time every stage through telemetry (synchronizes after each kernel).
    pub fn with_stage_profiling(mut self, enabled: bool) -> Self {
        self.profile_stages = enabled;
        self
    }

    pub fn plan(&self) -> &NetworkPlan {
        &self.plan
    }

    pub fn ops(&self) -> &Arc<GpuInferenceOps> {
        &self.ops
    }

    pub fn memory_usage(&self) -> u64 {
        self.ops.memory_usage()
    }

    fn workspace(&self) -> MutexGuard<'_, GpuMobileNetWorkspace> {
        // Holds only reusable buffers, so a poisoned lock is still usable.
        self.workspace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire_input(&self, input: &[f32]) -> Result<GpuTensor> {
        let dims = self.plan.input_dims();
        let pooled = self.workspace().input_tensors.pop();
        match pooled {
            Some(existing) if existing.shape().dims() == dims.as_slice() => {
                self.ops
                    .upload_to_tensor(&existing, input)
                    .context("upload to pooled input tensor")?;
                Ok(existing)
            }
            _ => self
                .ops
                .upload_tensor(dims, input, Some("mobilenet_input"))
                .context("upload input tensor"),
        }
    }
}

impl InferenceBackend for GpuMobileNet {
    fn label(&self) -> String {
        let info = self.ops.context().adapter_info();
        format!("gpu ({}, {:?})", info.name, info.backend)
    }

    fn infer(&self, input: &[f32]) -> Result<Vec<f32>> {
        ensure_input_len(&self.plan, input)?;
        let input_gpu = self.acquire_input(input)?;
        let result = execute_plan(
            self.ops.as_ref(),
            &self.weights,
            &self.plan,
            &input_gpu,
            self.profile_stages,
        )
        .and_then(|logits| logits.to_vec());
        self.workspace().input_tensors.push(input_gpu);
        result
    }

    fn synchronize(&self) -> Result<()> {
        self.ops.synchronize()
    }
}

/// Upper bound on pooled GPU memory for one pass: all weights plus a few
/// copies of the largest activation (current, next, residual, expansion).
pub fn estimate_inference_memory(plan: &NetworkPlan) -> u64 {
    plan.weight_bytes() + plan.peak_activation_bytes() * 4
}

/// MobileNetV2 on the multi-threaded CPU reference kernels.
#[derive(Debug, Clone)]
pub struct CpuMobileNet {
    weights: Arc<WeightSet>,
    plan: NetworkPlan,
    profile_stages: bool,
}

impl CpuMobileNet {
    pub fn new(weights: Arc<WeightSet>, plan: NetworkPlan) -> Result<Self> {
        weights.validate_for(&plan)?;
        Ok(Self {
            weights,
            plan,
            profile_stages: false,
        })
    }

    pub fn with_stage_profiling(mut self, enabled: bool) -> Self {
        self.profile_stages = enabled;
        self
    }

    pub fn plan(&self) -> &NetworkPlan {
        &self.plan
    }
}

impl InferenceBackend for CpuMobileNet {
    fn label(&self) -> String {
        format!("cpu ({} threads)", rayon::current_num_threads())
    }

    fn infer(&self, input: &[f32]) -> Result<Vec<f32>> {
        ensure_input_len(&self.plan, input)?;
        let tensor = HostTensor::new(self.plan.input_dims(), input.to_vec())?;
        let logits = execute_plan(
            &CpuKernels,
            self.weights.as_ref(),
            &self.plan,
            &tensor,
            self.profile_stages,
        )?;
        Ok(logits.to_vec())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}
