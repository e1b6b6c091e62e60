//! Benchmark settings shared by the inference core and the driver.
//!
//! Everything that used to be a compile-time constant of the harness (test
//! count, iteration count, input geometry, tolerance) lives here and is passed
//! down explicitly. Settings serialize to JSON so a run can be reproduced from
//! a file, and every field has a default so partial files are accepted.

use crate::gpu::GpuContextOptions;

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr};

/// Geometry of one input image (batch size is always 1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputDimensions {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
}

impl Default for InputDimensions {
    fn default() -> Self {
        Self {
            channels: 3,
            height: 224,
            width: 224,
        }
    }
}

impl InputDimensions {
    /// Number of `f32` values in one flattened image.
    pub fn elements(&self) -> usize {
        self.channels as usize * self.height as usize * self.width as usize
    }
}

/// Which implementation executes the forward pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// WGSL kernels on the selected `wgpu` adapter.
    #[default]
    Gpu,
    /// Multi-threaded CPU reference kernels.
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Gpu => "gpu",
            Backend::Cpu => "cpu",
        })
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(Backend::Gpu),
            "cpu" => Ok(Backend::Cpu),
            other => Err(format!("invalid backend '{other}'; expected 'gpu' or 'cpu'")),
        }
    }
}

/// Forward-pass execution preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionSettings {
    pub backend: Backend,
    /// Fold each ReLU6 into the convolution that precedes it.
    pub fuse_activations: bool,
    /// Cap on activation/weight buffer memory owned by the GPU buffer pool.
    pub memory_limit_mb: Option<u64>,
    /// Untimed passes per test case before measurement starts.
    pub warmup_iterations: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Gpu,
            fuse_activations: true,
            memory_limit_mb: None,
            warmup_iterations: 0,
        }
    }
}

impl ExecutionSettings {
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Whether per-stage timing logs are enabled.
    pub enabled: bool,
    /// Logging level for telemetry output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string into a `LevelFilter`.
    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(self.level.trim()).unwrap_or(LevelFilter::Debug)
    }
}

/// GPU-specific runtime preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSettings {
    /// Whether GPU execution should be attempted at all.
    pub enabled: bool,
    /// Respect `WGPU_*` environment overrides when initializing the backend.
    pub respect_env: bool,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
        }
    }
}

impl From<&GpuSettings> for GpuContextOptions {
    fn from(settings: &GpuSettings) -> Self {
        GpuContextOptions {
            enabled: settings.enabled,
            respect_env: settings.respect_env,
            ..Default::default()
        }
    }
}

/// Complete description of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchSettings {
    /// Directory holding `manifest.json` and the raw weight files.
    pub weights_dir: PathBuf,
    /// Whitespace-separated input images, one per test case.
    pub input_path: PathBuf,
    /// Whitespace-separated reference logits, one vector per test case.
    pub reference_path: PathBuf,
    pub test_cases: usize,
    pub iterations: usize,
    /// Maximum absolute difference accepted against the reference logits.
    pub tolerance: f32,
    pub input: InputDimensions,
    pub classes: u32,
    pub execution: ExecutionSettings,
    pub telemetry: TelemetrySettings,
    pub gpu: GpuSettings,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            weights_dir: PathBuf::from("weights"),
            input_path: PathBuf::from("mobilenetInput.txt"),
            reference_path: PathBuf::from("mobilenetOutput.txt"),
            test_cases: 10,
            iterations: 500,
            tolerance: 1e-5,
            input: InputDimensions::default(),
            classes: 1000,
            execution: ExecutionSettings::default(),
            telemetry: TelemetrySettings::default(),
            gpu: GpuSettings::default(),
        }
    }
}

impl BenchSettings {
    /// Load settings from a JSON file; missing fields take their defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: BenchSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }

    /// Reject settings that cannot describe a runnable benchmark.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.test_cases > 0, "test_cases must be at least 1");
        anyhow::ensure!(self.iterations > 0, "iterations must be at least 1");
        anyhow::ensure!(self.classes > 0, "classes must be at least 1");
        anyhow::ensure!(
            self.tolerance.is_finite() && self.tolerance >= 0.0,
            "tolerance must be a finite non-negative number (got {})",
            self.tolerance
        );
        let InputDimensions {
            channels,
            height,
            width,
        } = self.input;
        anyhow::ensure!(
            channels > 0 && height > 0 && width > 0,
            "input dimensions must be non-zero (got {channels}x{height}x{width})"
        );
        Ok(())
    }
}
