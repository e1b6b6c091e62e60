//! Command-line argument definitions for mobilenet-bench.

use clap::{ArgAction, Parser, ValueEnum};
use log::LevelFilter;
use mobilenet_utils::{Backend, BenchSettings};
use std::path::PathBuf;

/// Time MobileNetV2 forward passes and check them against reference logits.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct BenchArgs {
    /// Optional settings JSON. Command-line flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory containing `manifest.json` and the raw weight files.
    #[arg(short, long)]
    pub weights: Option<PathBuf>,

    /// Whitespace-separated input images, one per test case.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Whitespace-separated reference logits, one vector per test case.
    #[arg(short, long)]
    pub reference: Option<PathBuf>,

    /// Number of test cases to read and run.
    #[arg(long)]
    pub cases: Option<usize>,

    /// Timed forward passes per test case.
    #[arg(long)]
    pub iterations: Option<usize>,

    /// Untimed passes per test case before timing starts.
    #[arg(long)]
    pub warmup: Option<usize>,

    /// Maximum absolute difference accepted against the reference.
    #[arg(long)]
    pub tolerance: Option<f32>,

    /// Execution backend: `gpu` (falls back to CPU if unavailable) or `cpu`.
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<Backend>,

    /// Run every ReLU6 as its own kernel instead of fusing it into the convolution.
    #[arg(long = "no-fuse", action = ArgAction::SetTrue)]
    pub no_fuse: bool,

    /// Square input resolution (pixels); the channel count stays at the configured value.
    #[arg(long, value_name = "PIXELS")]
    pub input_size: Option<u32>,

    /// Cap on GPU buffer pool memory, in MiB.
    #[arg(long, value_name = "MIB")]
    pub memory_limit_mb: Option<u64>,

    /// Control whether `WGPU_*` env vars influence GPU selection (`auto` or `ignore`).
    #[arg(long = "gpu-env", value_enum)]
    pub gpu_env: Option<GpuEnvMode>,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,

    /// Log the duration of every network stage (synchronizes after each kernel).
    #[arg(long = "profile-stages", action = ArgAction::SetTrue)]
    pub profile_stages: bool,

    /// Write the benchmark summary to a JSON file.
    #[arg(long)]
    pub json: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum GpuEnvMode {
    /// Respect environment overrides such as `WGPU_BACKEND`.
    Auto,
    /// Ignore environment overrides and rely solely on CLI/config.
    Ignore,
}

impl GpuEnvMode {
    pub fn respects_env(self) -> bool {
        matches!(self, GpuEnvMode::Auto)
    }
}

impl BenchArgs {
    /// Fold command-line overrides into `settings`.
    pub fn apply_overrides(&self, settings: &mut BenchSettings) {
        if let Some(path) = &self.weights {
            settings.weights_dir = path.clone();
        }
        if let Some(path) = &self.input {
            settings.input_path = path.clone();
        }
        if let Some(path) = &self.reference {
            settings.reference_path = path.clone();
        }
        if let Some(cases) = self.cases {
            settings.test_cases = cases;
        }
        if let Some(iterations) = self.iterations {
            settings.iterations = iterations;
        }
        if let Some(warmup) = self.warmup {
            settings.execution.warmup_iterations = warmup;
        }
        if let Some(tolerance) = self.tolerance {
            settings.tolerance = tolerance;
        }
        if let Some(backend) = self.backend {
            settings.execution.backend = backend;
        }
        if self.no_fuse {
            settings.execution.fuse_activations = false;
        }
        if let Some(size) = self.input_size {
            settings.input.height = size;
            settings.input.width = size;
        }
        if let Some(limit) = self.memory_limit_mb {
            settings.execution.memory_limit_mb = Some(limit);
        }
        if let Some(mode) = self.gpu_env {
            settings.gpu.respect_env = mode.respects_env();
        }
        if self.telemetry || self.profile_stages {
            settings.telemetry.enabled = true;
        }
        if let Some(level) = &self.telemetry_level {
            settings.telemetry.level = level.clone();
        } else if self.profile_stages
            && settings.telemetry.level_filter() < LevelFilter::Debug
        {
            // Stage timings are logged at debug.
            settings.telemetry.level = "debug".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> BenchArgs {
        BenchArgs::try_parse_from(std::iter::once("mobilenet-bench").chain(args.iter().copied()))
            .expect("parse args")
    }

    #[test]
    fn overrides_replace_file_values() {
        let args = parse(&[
            "--iterations",
            "3",
            "--cases",
            "2",
            "--backend",
            "cpu",
            "--no-fuse",
            "--input-size",
            "96",
            "--tolerance",
            "0.5",
        ]);
        let mut settings = BenchSettings::default();
        args.apply_overrides(&mut settings);
        assert_eq!(settings.iterations, 3);
        assert_eq!(settings.test_cases, 2);
        assert_eq!(settings.execution.backend, Backend::Cpu);
        assert!(!settings.execution.fuse_activations);
        assert_eq!((settings.input.height, settings.input.width), (96, 96));
        assert_eq!(settings.input.channels, 3);
        assert_eq!(settings.tolerance, 0.5);
    }

    #[test]
    fn absent_flags_keep_settings() {
        let mut settings = BenchSettings::default();
        parse(&[]).apply_overrides(&mut settings);
        assert_eq!(settings.iterations, 500);
        assert!(settings.execution.fuse_activations);
        assert!(!settings.telemetry.enabled);
    }

    #[test]
    fn profiling_turns_on_debug_telemetry() {
        let mut settings = BenchSettings::default();
        settings.telemetry.level = "info".into();
        parse(&["--profile-stages"]).apply_overrides(&mut settings);
        assert!(settings.telemetry.enabled);
        assert_eq!(settings.telemetry.level_filter(), LevelFilter::Debug);
    }

    #[test]
    fn invalid_backend_is_rejected() {
        let result = BenchArgs::try_parse_from(["mobilenet-bench", "--backend", "tpu"]);
        assert!(result.is_err());
    }
}
