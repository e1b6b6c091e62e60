//! Named parameter tensors and the on-disk manifest format.
//!
//! A weight directory holds `manifest.json` plus one raw little-endian `f32`
//! file per tensor:
//!
//! ```json
//! { "tensors": [ { "name": "block01.conv.weight", "dims": [32, 3, 3, 3], "file": "block01.conv.weight.bin" } ] }
//! ```
//!
//! BatchNorm parameters are expected to be folded into the convolution
//! weights and biases before export.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::layers::{ShapedTensor, WeightProvider};
use crate::plan::{NetworkPlan, WeightSpec};
use crate::tensor::HostTensor;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    tensors: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    name: String,
    dims: Vec<usize>,
    file: PathBuf,
}

/// Host copies of every parameter tensor, keyed by layer name.
#[derive(Debug, Clone, Default)]
pub struct WeightSet {
    tensors: HashMap<String, HostTensor>,
}

impl WeightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tensor, returning the previous one.
    pub fn insert(&mut self, name: impl Into<String>, tensor: HostTensor) -> Option<HostTensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<HostTensor> {
        self.tensors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostTensor)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Total parameter bytes held.
    pub fn size_bytes(&self) -> u64 {
        self.tensors
            .values()
            .map(|tensor| tensor.shape().size_bytes())
            .sum()
    }

    /// Build a weight set for `plan`, asking `init` for each tensor's values.
    pub fn from_fn<F>(plan: &NetworkPlan, mut init: F) -> Result<Self>
    where
        F: FnMut(&WeightSpec) -> Vec<f32>,
    {
        let mut set = Self::new();
        for spec in plan.weight_specs() {
            let tensor = HostTensor::new(spec.dims.clone(), init(spec))
                .with_context(|| format!("initializer produced a bad tensor for {}", spec.name))?;
            set.insert(spec.name.clone(), tensor);
        }
        Ok(set)
    }

    /// Every parameter of `plan` filled with `value`.
    pub fn constant(plan: &NetworkPlan, value: f32) -> Result<Self> {
        Self::from_fn(plan, |spec| {
            vec![value; spec.dims.iter().product::<usize>()]
        })
    }

    /// Check that every tensor `plan` needs is present with the right shape.
    ///
    /// Extra tensors are tolerated with a warning so one export can serve
    /// several network variants.
    pub fn validate_for(&self, plan: &NetworkPlan) -> Result<()> {
        let mut missing = Vec::new();
        for spec in plan.weight_specs() {
            match self.tensors.get(&spec.name) {
                None => missing.push(spec.name.as_str()),
                Some(tensor) => anyhow::ensure!(
                    tensor.dims() == spec.dims.as_slice(),
                    "weight '{}' has dims {:?} but the network expects {:?}",
                    spec.name,
                    tensor.dims(),
                    spec.dims
                ),
            }
        }
        anyhow::ensure!(
            missing.is_empty(),
            "{} weight tensor(s) missing, first: {}",
            missing.len(),
            missing.first().copied().unwrap_or_default()
        );

        let expected = plan.weight_specs().len();
        if self.tensors.len() > expected {
            warn!(
                "weight set holds {} tensors; the network uses {expected}, the rest are ignored",
                self.tensors.len()
            );
        }
        Ok(())
    }

    /// Load every tensor listed in `<dir>/manifest.json`.
    pub fn load_manifest<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let manifest_path = dir.join(MANIFEST_FILE);
        let contents = fs::read_to_string(&manifest_path)
            .with_context(|| {
                format!("failed to read weight manifest {}", manifest_path.display())
            })?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .with_context(|| {
                format!("failed to parse weight manifest {}", manifest_path.display())
            })?;

        let mut set = Self::new();
        for entry in manifest.tensors {
            let path = dir.join(&entry.file);
            let data = read_f32_file(&path)
                .with_context(|| format!("failed to load weight '{}'", entry.name))?;
            let tensor = HostTensor::new(entry.dims, data)
                .with_context(|| {
                    format!("weight '{}' does not match its manifest dims", entry.name)
                })?;
            anyhow::ensure!(
                set.insert(entry.name.clone(), tensor).is_none(),
                "weight '{}' is listed twice in the manifest",
                entry.name
            );
        }
        debug!(
            "loaded {} weight tensors ({} bytes) from {}",
            set.len(),
            set.size_bytes(),
            dir.display()
        );
        Ok(set)
    }

    /// Write `manifest.json` and one `<name>.bin` file per tensor into `dir`.
    pub fn save_manifest<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create weight directory {}", dir.display()))?;

        let mut tensors = Vec::with_capacity(self.tensors.len());
        for name in self.names() {
            let tensor = &self.tensors[name];
            let file = PathBuf::from(format!("{name}.bin"));
            write_f32_file(&dir.join(&file), tensor.data())
                .with_context(|| format!("failed to write weight '{name}'"))?;
            tensors.push(ManifestEntry {
                name: name.to_string(),
                dims: tensor.dims().to_vec(),
                file,
            });
        }
        let payload = serde_json::to_string_pretty(&Manifest { tensors })
            .context("failed to serialize weight manifest")?;
        let manifest_path = dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, payload)
            .with_context(|| format!("failed to write {}", manifest_path.display()))?;
        Ok(())
    }
}

impl WeightProvider<HostTensor> for WeightSet {
    fn tensor(&self, name: &str) -> Result<&HostTensor> {
        self.tensors
            .get(name)
            .with_context(|| format!("weight '{name}' not found"))
    }
}

fn read_f32_file(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    anyhow::ensure!(
        bytes.len() % 4 == 0,
        "{} is {} bytes, not a whole number of f32 values",
        path.display(),
        bytes.len()
    );
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn write_f32_file(path: &Path, values: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = values.iter().flat_map(|value| value.to_le_bytes()).collect();
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanOptions;
    use crate::topology::MOBILENET_V2_BLOCKS;
    use mobilenet_utils::InputDimensions;
    use tempfile::tempdir;

    fn plan() -> NetworkPlan {
        NetworkPlan::new(
            &MOBILENET_V2_BLOCKS,
            InputDimensions {
                channels: 3,
                height: 32,
                width: 32,
            },
            PlanOptions::default(),
        )
        .expect("plan")
    }

    #[test]
    fn manifest_round_trip_preserves_tensors() {
        let plan = plan();
        let mut counter = 0.0f32;
        let set = WeightSet::from_fn(&plan, |spec| {
            counter += 1.0;
            let len: usize = spec.dims.iter().product();
            (0..len).map(|i| counter + i as f32 * -0.5e-3).collect()
        })
        .expect("weights");

        let dir = tempdir().expect("tempdir");
        set.save_manifest(dir.path()).expect("save");
        assert!(dir.path().join(MANIFEST_FILE).exists());

        let loaded = WeightSet::load_manifest(dir.path()).expect("load");
        assert_eq!(loaded.len(), set.len());
        for (name, tensor) in set.iter() {
            assert_eq!(loaded.get(name), Some(tensor), "{name}");
        }
        loaded.validate_for(&plan).expect("valid");
    }

    #[test]
    fn validation_reports_missing_and_misshapen_weights() {
        let plan = plan();
        let mut set = WeightSet::constant(&plan, 0.5).expect("weights");
        set.remove("block19.conv.bias");
        let err = set.validate_for(&plan).expect_err("missing");
        assert!(err.to_string().contains("block19.conv.bias"), "{err}");

        let mut set = WeightSet::constant(&plan, 0.5).expect("weights");
        set.insert(
            "block05.project.weight",
            HostTensor::filled([32usize, 144, 1, 1], 0.0).expect("tensor"),
        );
        let err = set.validate_for(&plan).expect_err("wrong dims");
        assert!(err.to_string().contains("block05.project.weight"), "{err}");
    }

    #[test]
    fn extra_weights_are_tolerated() {
        let plan = plan();
        let mut set = WeightSet::constant(&plan, 0.0).expect("weights");
        set.insert("unused.weight", HostTensor::filled([4usize], 1.0).expect("tensor"));
        set.validate_for(&plan).expect("extras are fine");
    }

    #[test]
    fn truncated_weight_file_is_rejected() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{ "tensors": [ { "name": "w", "dims": [2, 2], "file": "w.bin" } ] }"#,
        )
        .expect("manifest");
        fs::write(dir.path().join("w.bin"), [0u8; 12]).expect("data");
        let err = WeightSet::load_manifest(dir.path()).expect_err("short file");
        assert!(format!("{err:#}").contains("'w'"), "{err:#}");

        fs::write(dir.path().join("w.bin"), [0u8; 15]).expect("data");
        assert!(WeightSet::load_manifest(dir.path()).is_err());
    }

    #[test]
    fn provider_lookup_names_the_missing_tensor() {
        let set = WeightSet::new();
        let err = set.tensor("block01.conv.weight").expect_err("empty set");
        assert!(err.to_string().contains("block01.conv.weight"));
    }
}
