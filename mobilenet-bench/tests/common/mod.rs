//! Common fixtures for CLI integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use mobilenet_core::{MOBILENET_V2_BLOCKS, NetworkPlan, PlanOptions, WeightSet};
use mobilenet_utils::{InputDimensions, write_float_records};

/// Small square input so CPU runs stay fast.
pub const INPUT_SIZE: u32 = 32;
pub const CLASSES: usize = 1000;

pub struct BenchFixture {
    pub weights_dir: PathBuf,
    pub input_path: PathBuf,
    pub reference_path: PathBuf,
}

/// Expected logits: zero weights leave only the classifier bias `0.001 * k`.
pub fn expected_logits() -> Vec<f32> {
    (0..CLASSES).map(|k| 0.001 * k as f32).collect()
}

/// Write weights, `cases` inputs and matching references under `dir`.
///
/// `reference_offset` is added to every reference value to provoke mismatches.
pub fn write_fixture(dir: &Path, cases: usize, reference_offset: f32) -> BenchFixture {
    let plan = NetworkPlan::new(
        &MOBILENET_V2_BLOCKS,
        InputDimensions {
            channels: 3,
            height: INPUT_SIZE,
            width: INPUT_SIZE,
        },
        PlanOptions::default(),
    )
    .expect("plan");
    let weights = WeightSet::from_fn(&plan, |spec| {
        let len: usize = spec.dims.iter().product();
        if spec.name == "block20.classifier.bias" {
            expected_logits()
        } else {
            vec![0.0; len]
        }
    })
    .expect("weights");

    let weights_dir = dir.join("weights");
    weights.save_manifest(&weights_dir).expect("save weights");

    let pixels = plan.input().elements();
    let inputs: Vec<Vec<f32>> = (0..cases)
        .map(|case| (0..pixels).map(|i| ((i + case) % 7) as f32 * 0.1).collect())
        .collect();
    let input_path = dir.join("mobilenetInput.txt");
    write_float_records(&input_path, &inputs).expect("write inputs");

    let reference: Vec<f32> = expected_logits()
        .into_iter()
        .map(|value| value + reference_offset)
        .collect();
    let references = vec![reference; cases];
    let reference_path = dir.join("mobilenetOutput.txt");
    write_float_records(&reference_path, &references).expect("write references");

    BenchFixture {
        weights_dir,
        input_path,
        reference_path,
    }
}

/// Arguments shared by every CLI run over a fixture.
pub fn base_args(fixture: &BenchFixture, cases: usize) -> Vec<String> {
    vec![
        "--weights".into(),
        fixture.weights_dir.display().to_string(),
        "--input".into(),
        fixture.input_path.display().to_string(),
        "--reference".into(),
        fixture.reference_path.display().to_string(),
        "--cases".into(),
        cases.to_string(),
        "--iterations".into(),
        "2".into(),
        "--input-size".into(),
        INPUT_SIZE.to_string(),
        "--backend".into(),
        "cpu".into(),
    ]
}
