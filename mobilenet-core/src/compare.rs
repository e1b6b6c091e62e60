use anyhow::Result;
use serde::Serialize;

/// Outcome of checking one output vector against its reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OutputComparison {
    /// Largest absolute element difference; infinite when either side is NaN.
    pub max_abs_diff: f32,
    /// Index of the element with the largest difference.
    pub worst_index: usize,
    pub within_tolerance: bool,
}

/// Compare `actual` against `expected` element by element.
///
/// A NaN on either side counts as an infinite difference so a broken kernel
/// can never pass the tolerance check.
pub fn compare_outputs(
    actual: &[f32],
    expected: &[f32],
    tolerance: f32,
) -> Result<OutputComparison> {
    anyhow::ensure!(
        actual.len() == expected.len(),
        "output has {} values but the reference has {}",
        actual.len(),
        expected.len()
    );
    anyhow::ensure!(!actual.is_empty(), "cannot compare empty outputs");

    let mut max_abs_diff = 0.0f32;
    let mut worst_index = 0usize;
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        let diff = (a - e).abs();
        let diff = if diff.is_nan() { f32::INFINITY } else { diff };
        if diff > max_abs_diff {
            max_abs_diff = diff;
            worst_index = idx;
        }
    }
    Ok(OutputComparison {
        max_abs_diff,
        worst_index,
        within_tolerance: max_abs_diff <= tolerance,
    })
}
