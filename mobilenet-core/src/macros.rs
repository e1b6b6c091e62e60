/// Declare one inverted-residual block of the topology table.
///
/// `inverted_residual!(4, t = 6, c = 24, s = 1, skip)` adds the block input
/// back onto the projection output; omit `skip` for plain blocks.
#[macro_export]
macro_rules! inverted_residual {
    ($index:literal, t = $t:literal, c = $c:literal, s = $s:literal) => {
        $crate::topology::BlockSpec {
            index: $index,
            kind: $crate::topology::BlockKind::InvertedResidual {
                expansion: $t,
                out_channels: $c,
                stride: $s,
                residual: false,
            },
        }
    };
    ($index:literal, t = $t:literal, c = $c:literal, s = $s:literal, skip) => {
        $crate::topology::BlockSpec {
            index: $index,
            kind: $crate::topology::BlockKind::InvertedResidual {
                expansion: $t,
                out_channels: $c,
                stride: $s,
                residual: true,
            },
        }
    };
}
