//! Declarative MobileNetV2 (width 1.0) block table and layer naming.

use std::fmt;

/// What a block computes; channel counts on the input side come from the
/// previous block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Standard convolution followed by ReLU6.
    Stem {
        out_channels: u32,
        kernel: u32,
        stride: u32,
    },
    /// Optional 1x1 expansion, 3x3 depthwise, linear 1x1 projection.
    InvertedResidual {
        expansion: u32,
        out_channels: u32,
        stride: u32,
        residual: bool,
    },
    /// 1x1 convolution followed by ReLU6.
    PointwiseHead { out_channels: u32 },
    /// Global average pool followed by the fully connected layer.
    Classifier { classes: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    /// 1-based position, used in layer names and diagnostics.
    pub index: u8,
    pub kind: BlockKind,
}

pub const MOBILENET_V2_BLOCKS: [BlockSpec; 20] = [
    BlockSpec {
        index: 1,
        kind: BlockKind::Stem {
            out_channels: 32,
            kernel: 3,
            stride: 2,
        },
    },
    crate::inverted_residual!(2, t = 1, c = 16, s = 1),
    crate::inverted_residual!(3, t = 6, c = 24, s = 2),
    crate::inverted_residual!(4, t = 6, c = 24, s = 1, skip),
    crate::inverted_residual!(5, t = 6, c = 32, s = 2),
    crate::inverted_residual!(6, t = 6, c = 32, s = 1, skip),
    crate::inverted_residual!(7, t = 6, c = 32, s = 1, skip),
    crate::inverted_residual!(8, t = 6, c = 64, s = 2),
    crate::inverted_residual!(9, t = 6, c = 64, s = 1, skip),
    crate::inverted_residual!(10, t = 6, c = 64, s = 1, skip),
    crate::inverted_residual!(11, t = 6, c = 64, s = 1, skip),
    crate::inverted_residual!(12, t = 6, c = 96, s = 1),
    crate::inverted_residual!(13, t = 6, c = 96, s = 1, skip),
    crate::inverted_residual!(14, t = 6, c = 96, s = 1, skip),
    crate::inverted_residual!(15, t = 6, c = 160, s = 2),
    crate::inverted_residual!(16, t = 6, c = 160, s = 1, skip),
    crate::inverted_residual!(17, t = 6, c = 160, s = 1, skip),
    crate::inverted_residual!(18, t = 6, c = 320, s = 1),
    BlockSpec {
        index: 19,
        kind: BlockKind::PointwiseHead { out_channels: 1280 },
    },
    BlockSpec {
        index: 20,
        kind: BlockKind::Classifier { classes: 1000 },
    },
];

/// Role of a parameterized layer inside its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerRole {
    Conv,
    Expand,
    Depthwise,
    Project,
    Classifier,
}

impl LayerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            LayerRole::Conv => "conv",
            LayerRole::Expand => "expand",
            LayerRole::Depthwise => "depthwise",
            LayerRole::Project => "project",
            LayerRole::Classifier => "classifier",
        }
    }
}

impl fmt::Display for LayerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifiers of one layer's parameters, e.g. `block03.expand.weight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerNames {
    pub weight: String,
    pub bias: String,
}

impl LayerNames {
    pub fn new(block: u8, role: LayerRole) -> Self {
        let prefix = format!("block{block:02}.{role}");
        Self {
            weight: format!("{prefix}.weight"),
            bias: format!("{prefix}.bias"),
        }
    }
}
