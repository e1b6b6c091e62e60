//! Weight directories written and read back through the manifest.

mod common;

use std::{fs, sync::Arc};

use common::{FIXTURE_INPUT, fixture_logits, fixture_weights, plan};
use mobilenet_core::{CpuMobileNet, InferenceBackend, MANIFEST_FILE, WeightSet};
use tempfile::tempdir;

#[test]
fn saved_fixture_reloads_and_runs() {
    let plan = plan(32, true);
    let dir = tempdir().expect("tempdir");
    fixture_weights(&plan)
        .save_manifest(dir.path())
        .expect("save manifest");

    let loaded = WeightSet::load_manifest(dir.path()).expect("load manifest");
    assert_eq!(loaded.len(), plan.weight_specs().len());
    let model = CpuMobileNet::new(Arc::new(loaded), plan).expect("model");
    let logits = model
        .infer(&vec![FIXTURE_INPUT; 3 * 32 * 32])
        .expect("forward pass");
    let expected = fixture_logits(1000);
    for (k, (got, want)) in logits.iter().zip(&expected).enumerate() {
        assert!((got - want).abs() <= 1e-5, "logit {k}: {got} vs {want}");
    }
}

#[test]
fn manifest_with_wrong_dims_is_rejected_by_the_model() {
    let plan = plan(32, true);
    let dir = tempdir().expect("tempdir");
    fixture_weights(&plan)
        .save_manifest(dir.path())
        .expect("save manifest");

    // Claim the stem is 3x3x3x16: the raw file no longer matches.
    let manifest_path = dir.path().join(MANIFEST_FILE);
    let manifest = fs::read_to_string(&manifest_path).expect("read manifest");
    let mut json: serde_json::Value = serde_json::from_str(&manifest).expect("json");
    for entry in json["tensors"].as_array_mut().expect("tensors") {
        if entry["name"] == "block01.conv.weight" {
            entry["dims"] = serde_json::json!([16, 3, 3, 3]);
        }
    }
    fs::write(&manifest_path, json.to_string()).expect("write manifest");
    assert!(WeightSet::load_manifest(dir.path()).is_err());
}

#[test]
fn missing_weight_directory_reports_the_path() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("nowhere");
    let err = WeightSet::load_manifest(&missing).expect_err("missing dir");
    assert!(format!("{err:#}").contains("nowhere"), "{err:#}");
}
