mod args;
mod benchmark;

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use mobilenet_core::{
    CpuMobileNet, GpuMobileNet, InferenceBackend, MOBILENET_V2_BLOCKS, NetworkPlan, PlanOptions,
    WeightSet,
};
use mobilenet_utils::{
    Backend, BenchSettings, configure_telemetry,
    gpu::{GpuAvailability, GpuContext, GpuContextOptions},
    init_logging, normalize_path, read_float_records,
    telemetry::TELEMETRY_TARGET,
};

use crate::args::BenchArgs;
use crate::benchmark::{RunOptions, run_benchmark};

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let args = BenchArgs::parse();

    let mut settings = load_settings(args.config.as_ref())?;
    args.apply_overrides(&mut settings);
    settings.validate()?;
    configure_telemetry(
        settings.telemetry.enabled,
        settings.telemetry.level_filter(),
    );

    let plan = NetworkPlan::new(
        &MOBILENET_V2_BLOCKS,
        settings.input,
        PlanOptions {
            fuse_activations: settings.execution.fuse_activations,
        },
    )?;
    anyhow::ensure!(
        plan.classes() == settings.classes as usize,
        "network produces {} classes but settings expect {}",
        plan.classes(),
        settings.classes
    );

    let weights_dir = normalize_path(&settings.weights_dir)?;
    info!("Loading weights from {}", weights_dir.display());
    let weights = WeightSet::load_manifest(&weights_dir)?;
    weights.validate_for(&plan)?;

    let inputs = read_float_records(
        &settings.input_path,
        plan.input().elements(),
        settings.test_cases,
    )
    .context("failed to read benchmark inputs")?;
    let references = read_float_records(
        &settings.reference_path,
        plan.classes(),
        settings.test_cases,
    )
    .context("failed to read reference outputs")?;

    let backend = build_backend(&settings, weights, plan, args.profile_stages)?;
    let summary = run_benchmark(
        backend.as_ref(),
        &inputs,
        &references,
        RunOptions {
            iterations: settings.iterations,
            warmup_iterations: settings.execution.warmup_iterations,
            tolerance: settings.tolerance,
        },
    )?;

    println!("Average Time is: {:.3} ms", summary.avg_ms);
    info!(
        target: TELEMETRY_TARGET,
        "benchmark_summary {}",
        serde_json::to_string(&summary)?
    );
    if summary.mismatches > 0 {
        warn!(
            "{} of {} case(s) exceeded tolerance {}",
            summary.mismatches, summary.test_cases, settings.tolerance
        );
    }

    if let Some(path) = &args.json {
        let payload = serde_json::to_string_pretty(&summary)?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write JSON report {}", path.display()))?;
        info!("Wrote benchmark report to {}", path.display());
    }

    Ok(())
}

fn load_settings(config_path: Option<&PathBuf>) -> Result<BenchSettings> {
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        BenchSettings::load_from_path(&resolved)
    } else {
        Ok(BenchSettings::default())
    }
}

/// GPU when requested and available, otherwise the CPU reference kernels.
fn build_backend(
    settings: &BenchSettings,
    weights: WeightSet,
    plan: NetworkPlan,
    profile_stages: bool,
) -> Result<Box<dyn InferenceBackend>> {
    if settings.execution.backend == Backend::Gpu {
        let options: GpuContextOptions = (&settings.gpu).into();
        match GpuContext::init_with_fallback(&options) {
            GpuAvailability::Available(ctx) => {
                info!(
                    "Using GPU adapter '{}' ({:?})",
                    ctx.adapter_info().name,
                    ctx.adapter_info().backend
                );
                let model = GpuMobileNet::new(
                    ctx,
                    &weights,
                    plan,
                    settings.execution.memory_limit_bytes(),
                )?
                .with_stage_profiling(profile_stages);
                return Ok(Box::new(model));
            }
            GpuAvailability::Disabled { reason } => {
                warn!("GPU backend disabled ({reason}); falling back to CPU reference kernels.");
            }
            GpuAvailability::Unavailable { error } => {
                warn!("GPU backend unavailable ({error}); falling back to CPU reference kernels.");
            }
        }
    }

    let model = CpuMobileNet::new(Arc::new(weights), plan)?.with_stage_profiling(profile_stages);
    Ok(Box::new(model))
}
