use anyhow::{Context, Result};
use log::Level;
use mobilenet_utils::telemetry::{TimingGuard, timing_guard_if};

use crate::layers::{LayerKernels, ShapedTensor, WeightProvider};
use crate::plan::{NetworkPlan, Stage};

/// Run every stage of `plan` on `input` and return the final activation.
///
/// At most one residual operand is alive at a time: `SaveSkip` stores a
/// handle to the block input and the matching `AddSkip` consumes it. Each
/// produced tensor is checked against the shape the plan recorded.
///
/// With `profile_stages` set (and telemetry enabled) every stage is timed;
/// the device is synchronized before each guard drops so the log reflects
/// kernel execution rather than submission.
pub fn execute_plan<K, W>(
    kernels: &K,
    weights: &W,
    plan: &NetworkPlan,
    input: &K::Tensor,
    profile_stages: bool,
) -> Result<K::Tensor>
where
    K: LayerKernels,
    W: WeightProvider<K::Tensor>,
{
    let input_dims = plan.input_dims();
    anyhow::ensure!(
        input.dims() == input_dims.as_slice(),
        "network input must be {input_dims:?} (got {:?})",
        input.dims()
    );

    let mut current = input.clone();
    let mut skip: Option<K::Tensor> = None;

    for (position, planned) in plan.stages().iter().enumerate() {
        let guard = stage_guard(profile_stages, planned.block, position, &planned.stage);
        let next = match &planned.stage {
            Stage::SaveSkip => {
                anyhow::ensure!(
                    skip.is_none(),
                    "block {} opens a residual while another is pending",
                    planned.block
                );
                skip = Some(current.clone());
                continue;
            }
            Stage::AddSkip => {
                let saved = skip.take().with_context(|| {
                    format!("block {} closes a residual that was never opened", planned.block)
                })?;
                kernels.add(&current, &saved)
            }
            Stage::Conv2d { layer, config } => kernels.conv2d(
                &current,
                weights.tensor(&layer.weight)?,
                weights.tensor(&layer.bias)?,
                config,
            ),
            Stage::DepthwiseConv2d { layer, config } => kernels.depthwise_conv2d(
                &current,
                weights.tensor(&layer.weight)?,
                weights.tensor(&layer.bias)?,
                config,
            ),
            Stage::PointwiseConv2d { layer, config } => kernels.pointwise_conv2d(
                &current,
                weights.tensor(&layer.weight)?,
                weights.tensor(&layer.bias)?,
                config,
            ),
            Stage::Relu6 => kernels.relu6(&current),
            Stage::GlobalAvgPool(config) => kernels.global_avg_pool(&current, config),
            Stage::Linear { layer, config } => kernels.linear(
                &current,
                weights.tensor(&layer.weight)?,
                weights.tensor(&layer.bias)?,
                config,
            ),
        }
        .with_context(|| {
            format!(
                "block {} stage {position} ({}) failed",
                planned.block,
                planned.stage.name()
            )
        })?;

        anyhow::ensure!(
            next.dims() == planned.output_dims.as_slice(),
            "block {} {} produced {:?}, expected {:?}",
            planned.block,
            planned.stage.name(),
            next.dims(),
            planned.output_dims
        );
        if let Some(guard) = guard
            && guard.is_active()
        {
            kernels.synchronize()?;
            drop(guard);
        }
        current = next;
    }

    anyhow::ensure!(skip.is_none(), "network ended with an unclosed residual");
    Ok(current)
}

fn stage_guard(enabled: bool, block: u8, position: usize, stage: &Stage) -> Option<TimingGuard> {
    enabled.then(|| {
        timing_guard_if(
            format!("block{block:02} stage{position:03} {}", stage.name()),
            Level::Debug,
            true,
        )
    })
}
