//! Flattening of the block table into a validated list of kernel calls.
//!
//! Every shape is derived here from the input geometry and the block specs,
//! once, before any weights are touched. The executor only replays the
//! stages and checks that each kernel produced the shape recorded here.

use anyhow::{Context, Result};
use mobilenet_utils::InputDimensions;

use crate::layers::{
    ActivationKind, Conv2dChannels, Conv2dConfig, LinearConfig, PoolConfig, SpatialDims,
};
use crate::topology::{BlockKind, BlockSpec, LayerNames, LayerRole};

/// One kernel call (or skip bookkeeping step) of the forward pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Conv2d {
        layer: LayerNames,
        config: Conv2dConfig,
    },
    DepthwiseConv2d {
        layer: LayerNames,
        config: Conv2dConfig,
    },
    PointwiseConv2d {
        layer: LayerNames,
        config: Conv2dConfig,
    },
    Relu6,
    /// Keep a handle to the current activation as the residual operand.
    SaveSkip,
    /// Add the saved residual operand to the current activation.
    AddSkip,
    GlobalAvgPool(PoolConfig),
    Linear {
        layer: LayerNames,
        config: LinearConfig,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Conv2d { .. } => "conv2d",
            Stage::DepthwiseConv2d { .. } => "depthwise",
            Stage::PointwiseConv2d { .. } => "pointwise",
            Stage::Relu6 => "relu6",
            Stage::SaveSkip => "save_skip",
            Stage::AddSkip => "add_skip",
            Stage::GlobalAvgPool(_) => "avg_pool",
            Stage::Linear { .. } => "linear",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStage {
    pub block: u8,
    pub stage: Stage,
    /// Shape of the current activation after this stage.
    pub output_dims: Vec<usize>,
}

/// Expected name and shape of one parameter tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightSpec {
    pub name: String,
    pub dims: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Fold ReLU6 into the preceding convolution instead of a separate pass.
    pub fuse_activations: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            fuse_activations: true,
        }
    }
}

/// Validated stage list for one network, input size and option set.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    input: InputDimensions,
    stages: Vec<PlannedStage>,
    weights: Vec<WeightSpec>,
    options: PlanOptions,
}

/// Running activation geometry while walking the block list.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    channels: u32,
    height: u32,
    width: u32,
}

impl Cursor {
    fn spatial(&self) -> SpatialDims {
        SpatialDims::new(self.width, self.height)
    }

    fn dims(&self) -> Vec<usize> {
        vec![
            1,
            self.channels as usize,
            self.height as usize,
            self.width as usize,
        ]
    }
}

struct PlanBuilder {
    stages: Vec<PlannedStage>,
    weights: Vec<WeightSpec>,
    options: PlanOptions,
    block: u8,
}

impl PlanBuilder {
    fn fused(&self) -> Option<ActivationKind> {
        self.options
            .fuse_activations
            .then_some(ActivationKind::Relu6)
    }

    fn push(&mut self, stage: Stage, output_dims: Vec<usize>) {
        self.stages.push(PlannedStage {
            block: self.block,
            stage,
            output_dims,
        });
    }

    fn push_conv_weights(&mut self, layer: &LayerNames, config: &Conv2dConfig) {
        self.weights.push(WeightSpec {
            name: layer.weight.clone(),
            dims: config.weight_shape_dims().to_vec(),
        });
        self.weights.push(WeightSpec {
            name: layer.bias.clone(),
            dims: config.bias_shape_dims().to_vec(),
        });
    }

    /// Emit a convolution stage, plus a standalone ReLU6 when `activated` and unfused.
    fn conv(
        &mut self,
        role: LayerRole,
        config: Conv2dConfig,
        activated: bool,
        make: fn(LayerNames, Conv2dConfig) -> Stage,
    ) -> Cursor {
        let layer = LayerNames::new(self.block, role);
        self.push_conv_weights(&layer, &config);
        let cursor = Cursor {
            channels: config.output_channels,
            height: config.output_height,
            width: config.output_width,
        };
        self.push(make(layer, config), cursor.dims());
        if activated && !self.options.fuse_activations {
            self.push(Stage::Relu6, cursor.dims());
        }
        cursor
    }

    fn activation_for(&self, activated: bool) -> Option<ActivationKind> {
        if activated { self.fused() } else { None }
    }
}

impl NetworkPlan {
    /// Walk `blocks` from `input` and record every stage with its output shape.
    pub fn new(
        blocks: &[BlockSpec],
        input: InputDimensions,
        options: PlanOptions,
    ) -> Result<Self> {
        anyhow::ensure!(!blocks.is_empty(), "network needs at least one block");
        anyhow::ensure!(
            input.channels > 0 && input.height > 0 && input.width > 0,
            "input dimensions must be non-zero"
        );
        let mut builder = PlanBuilder {
            stages: Vec::new(),
            weights: Vec::new(),
            options,
            block: 0,
        };
        let mut cursor = Cursor {
            channels: input.channels,
            height: input.height,
            width: input.width,
        };
        let mut classified = false;

        for block in blocks {
            anyhow::ensure!(
                !classified,
                "block {} follows the classifier; the classifier must be last",
                block.index
            );
            builder.block = block.index;
            cursor = plan_block(&mut builder, block, cursor)
                .with_context(|| format!("invalid block {}", block.index))?;
            classified = matches!(block.kind, BlockKind::Classifier { .. });
        }
        anyhow::ensure!(classified, "network must end with a classifier block");

        Ok(Self {
            input,
            stages: builder.stages,
            weights: builder.weights,
            options,
        })
    }

    pub fn input(&self) -> InputDimensions {
        self.input
    }

    pub fn input_dims(&self) -> Vec<usize> {
        vec![
            1,
            self.input.channels as usize,
            self.input.height as usize,
            self.input.width as usize,
        ]
    }

    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn weight_specs(&self) -> &[WeightSpec] {
        &self.weights
    }

    pub fn options(&self) -> PlanOptions {
        self.options
    }

    /// Shape of the plan's final output (the logits).
    pub fn output_dims(&self) -> &[usize] {
        self.stages
            .last()
            .map(|stage| stage.output_dims.as_slice())
            .unwrap_or(&[])
    }

    pub fn classes(&self) -> usize {
        self.output_dims().iter().product()
    }

    pub fn residual_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|stage| stage.stage == Stage::AddSkip)
            .count()
    }

    /// Output shape of the last stage belonging to `block`.
    pub fn block_output_dims(&self, block: u8) -> Option<&[usize]> {
        self.stages
            .iter()
            .rev()
            .find(|stage| stage.block == block)
            .map(|stage| stage.output_dims.as_slice())
    }

    /// Total parameter bytes the plan expects.
    pub fn weight_bytes(&self) -> u64 {
        self.weights
            .iter()
            .map(|spec| spec.dims.iter().product::<usize>() as u64 * 4)
            .sum()
    }

    /// Largest single activation, in bytes.
    pub fn peak_activation_bytes(&self) -> u64 {
        let input = self.input.elements() as u64;
        self.stages
            .iter()
            .map(|stage| stage.output_dims.iter().product::<usize>() as u64)
            .fold(input, u64::max)
            * 4
    }
}

fn plan_block(builder: &mut PlanBuilder, block: &BlockSpec, cursor: Cursor) -> Result<Cursor> {
    match block.kind {
        BlockKind::Stem {
            out_channels,
            kernel,
            stride,
        } => {
            let config = Conv2dConfig::standard(
                Conv2dChannels::new(cursor.channels, out_channels),
                cursor.spatial(),
                kernel,
                stride,
                builder.activation_for(true),
            )?;
            Ok(builder.conv(LayerRole::Conv, config, true, |layer, config| {
                Stage::Conv2d { layer, config }
            }))
        }
        BlockKind::InvertedResidual {
            expansion,
            out_channels,
            stride,
            residual,
        } => {
            anyhow::ensure!(expansion > 0, "expansion factor must be at least 1");
            if residual {
                anyhow::ensure!(
                    stride == 1 && cursor.channels == out_channels,
                    "residual connection needs an unchanged shape (stride {stride}, {} -> {out_channels} channels)",
                    cursor.channels
                );
                builder.push(Stage::SaveSkip, cursor.dims());
            }

            let hidden = cursor
                .channels
                .checked_mul(expansion)
                .context("expanded channel count overflows u32")?;
            let mut current = cursor;
            if expansion > 1 {
                let config = Conv2dConfig::pointwise(
                    Conv2dChannels::new(current.channels, hidden),
                    current.spatial(),
                    builder.activation_for(true),
                )?;
                current = builder.conv(LayerRole::Expand, config, true, pointwise_stage);
            }

            let config = Conv2dConfig::depthwise(
                hidden,
                current.spatial(),
                3,
                stride,
                builder.activation_for(true),
            )?;
            current = builder.conv(LayerRole::Depthwise, config, true, |layer, config| {
                Stage::DepthwiseConv2d { layer, config }
            });

            let config = Conv2dConfig::pointwise(
                Conv2dChannels::new(hidden, out_channels),
                current.spatial(),
                None,
            )?;
            current = builder.conv(LayerRole::Project, config, false, pointwise_stage);

            if residual {
                builder.push(Stage::AddSkip, current.dims());
            }
            Ok(current)
        }
        BlockKind::PointwiseHead { out_channels } => {
            let config = Conv2dConfig::pointwise(
                Conv2dChannels::new(cursor.channels, out_channels),
                cursor.spatial(),
                builder.activation_for(true),
            )?;
            Ok(builder.conv(LayerRole::Conv, config, true, pointwise_stage))
        }
        BlockKind::Classifier { classes } => {
            let pool = PoolConfig::new(cursor.channels, cursor.height, cursor.width)?;
            builder.push(
                Stage::GlobalAvgPool(pool),
                pool.output_shape_dims().to_vec(),
            );

            let config = LinearConfig::new(cursor.channels, classes)?;
            let layer = LayerNames::new(builder.block, LayerRole::Classifier);
            builder.weights.push(WeightSpec {
                name: layer.weight.clone(),
                dims: config.weight_shape_dims().to_vec(),
            });
            builder.weights.push(WeightSpec {
                name: layer.bias.clone(),
                dims: config.bias_shape_dims().to_vec(),
            });
            builder.push(
                Stage::Linear { layer, config },
                config.output_shape_dims().to_vec(),
            );
            // Pooled and classified tensors are [1, C]; the cursor only tracks channels now.
            Ok(Cursor {
                channels: classes,
                height: 1,
                width: 1,
            })
        }
    }
}

fn pointwise_stage(layer: LayerNames, config: Conv2dConfig) -> Stage {
    Stage::PointwiseConv2d { layer, config }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::MOBILENET_V2_BLOCKS;

    fn standard_plan(fuse: bool) -> NetworkPlan {
        NetworkPlan::new(
            &MOBILENET_V2_BLOCKS,
            InputDimensions::default(),
            PlanOptions {
                fuse_activations: fuse,
            },
        )
        .expect("standard plan")
    }

    #[test]
    fn block_outputs_follow_stride_schedule() {
        let plan = standard_plan(true);
        let expected: [(u8, [usize; 4]); 19] = [
            (1, [1, 32, 112, 112]),
            (2, [1, 16, 112, 112]),
            (3, [1, 24, 56, 56]),
            (4, [1, 24, 56, 56]),
            (5, [1, 32, 28, 28]),
            (6, [1, 32, 28, 28]),
            (7, [1, 32, 28, 28]),
            (8, [1, 64, 14, 14]),
            (9, [1, 64, 14, 14]),
            (10, [1, 64, 14, 14]),
            (11, [1, 64, 14, 14]),
            (12, [1, 96, 14, 14]),
            (13, [1, 96, 14, 14]),
            (14, [1, 96, 14, 14]),
            (15, [1, 160, 7, 7]),
            (16, [1, 160, 7, 7]),
            (17, [1, 160, 7, 7]),
            (18, [1, 320, 7, 7]),
            (19, [1, 1280, 7, 7]),
        ];
        for (block, dims) in expected {
            assert_eq!(
                plan.block_output_dims(block),
                Some(&dims[..]),
                "block {block}"
            );
        }
        let pool = plan
            .stages()
            .iter()
            .find(|stage| matches!(stage.stage, Stage::GlobalAvgPool(_)))
            .expect("pool stage");
        assert_eq!(pool.output_dims, vec![1, 1280]);
        assert_eq!(plan.output_dims(), &[1, 1000]);
        assert_eq!(plan.classes(), 1000);
    }

    #[test]
    fn plan_has_ten_residual_adds() {
        let plan = standard_plan(true);
        assert_eq!(plan.residual_count(), 10);
        let saves = plan
            .stages()
            .iter()
            .filter(|stage| stage.stage == Stage::SaveSkip)
            .count();
        assert_eq!(saves, 10);
    }

    #[test]
    fn unfused_plan_adds_standalone_activations() {
        let fused = standard_plan(true);
        let unfused = standard_plan(false);
        let relus = |plan: &NetworkPlan| {
            plan.stages()
                .iter()
                .filter(|stage| stage.stage == Stage::Relu6)
                .count()
        };
        assert_eq!(relus(&fused), 0);
        // Stem + 16 blocks with expansion (2 each) + block 2 depthwise + head.
        assert_eq!(relus(&unfused), 1 + 16 * 2 + 1 + 1);
        assert_eq!(fused.weight_specs(), unfused.weight_specs());
    }

    #[test]
    fn weight_specs_cover_every_layer() {
        let plan = standard_plan(true);
        let specs = plan.weight_specs();
        // Stem, 17 blocks (block 2 has no expansion), head, classifier.
        assert_eq!(specs.len(), 2 * (1 + 16 * 3 + 2 + 1 + 1));
        let find = |name: &str| {
            specs
                .iter()
                .find(|spec| spec.name == name)
                .map(|spec| spec.dims.clone())
        };
        assert_eq!(find("block01.conv.weight"), Some(vec![32, 3, 3, 3]));
        assert_eq!(find("block02.expand.weight"), None);
        assert_eq!(find("block02.depthwise.weight"), Some(vec![32, 1, 3, 3]));
        assert_eq!(find("block03.expand.weight"), Some(vec![96, 16, 1, 1]));
        assert_eq!(find("block18.project.weight"), Some(vec![320, 960, 1, 1]));
        assert_eq!(find("block19.conv.weight"), Some(vec![1280, 320, 1, 1]));
        assert_eq!(find("block20.classifier.weight"), Some(vec![1000, 1280]));
        assert_eq!(find("block20.classifier.bias"), Some(vec![1000]));
    }

    #[test]
    fn residual_on_shape_changing_block_is_rejected() {
        let mut blocks = MOBILENET_V2_BLOCKS;
        blocks[2] = crate::inverted_residual!(3, t = 6, c = 24, s = 2, skip);
        let err = NetworkPlan::new(&blocks, InputDimensions::default(), PlanOptions::default())
            .expect_err("must reject");
        assert!(format!("{err:#}").contains("residual connection"));
    }

    #[test]
    fn classifier_must_terminate_the_network() {
        let err = NetworkPlan::new(
            &MOBILENET_V2_BLOCKS[..19],
            InputDimensions::default(),
            PlanOptions::default(),
        )
        .expect_err("no classifier");
        assert!(err.to_string().contains("classifier"));
    }

    #[test]
    fn small_inputs_still_reach_the_classifier() {
        let plan = NetworkPlan::new(
            &MOBILENET_V2_BLOCKS,
            InputDimensions {
                channels: 3,
                height: 32,
                width: 32,
            },
            PlanOptions::default(),
        )
        .expect("32x32 plan");
        assert_eq!(plan.block_output_dims(19), Some(&[1, 1280, 1, 1][..]));
        assert_eq!(plan.output_dims(), &[1, 1000]);
    }

    #[test]
    fn peak_activation_is_the_expanded_early_tensor() {
        let plan = standard_plan(true);
        // Block 2 depthwise/stem at 32x112x112 is smaller than block 3's 96x112x112 expansion.
        assert_eq!(plan.peak_activation_bytes(), 96 * 112 * 112 * 4);
    }
}
