//! Timed forward passes validated against reference logits.

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use mobilenet_core::{InferenceBackend, compare_outputs};
use serde::Serialize;

/// What the timing loop needs besides the backend and the data.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub iterations: usize,
    pub warmup_iterations: usize,
    pub tolerance: f32,
}

#[derive(Debug, Serialize)]
pub struct CaseReport {
    pub case: usize,
    pub avg_ms: f64,
    pub max_abs_diff: f32,
    pub worst_index: usize,
    pub within_tolerance: bool,
    /// Every timed pass returned bit-identical logits.
    pub deterministic: bool,
}

#[derive(Debug, Serialize)]
pub struct BenchmarkSummary {
    pub backend: String,
    pub test_cases: usize,
    pub iterations_per_case: usize,
    pub warmup_iterations: usize,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mismatches: usize,
    pub nondeterministic: usize,
    pub cases: Vec<CaseReport>,
}

/// Run `options.iterations` timed passes per input and compare the last
/// output of each case against its reference.
///
/// Mismatches are reported and counted, never fatal; inference errors are.
pub fn run_benchmark(
    backend: &dyn InferenceBackend,
    inputs: &[Vec<f32>],
    references: &[Vec<f32>],
    options: RunOptions,
) -> Result<BenchmarkSummary> {
    anyhow::ensure!(!inputs.is_empty(), "benchmark requires at least one input");
    anyhow::ensure!(
        inputs.len() == references.len(),
        "{} inputs but {} reference vectors",
        inputs.len(),
        references.len()
    );
    anyhow::ensure!(options.iterations > 0, "iterations must be at least 1");

    let label = backend.label();
    info!(
        "Running {} case(s) x {} iteration(s) on {label}",
        inputs.len(),
        options.iterations
    );

    let mut timings = Vec::with_capacity(inputs.len() * options.iterations);
    let mut cases = Vec::with_capacity(inputs.len());
    for (case, (input, reference)) in inputs.iter().zip(references).enumerate() {
        for _ in 0..options.warmup_iterations {
            backend
                .infer(input)
                .with_context(|| format!("warm-up pass for case {case} failed"))?;
        }

        let mut case_timings = Vec::with_capacity(options.iterations);
        let mut first: Option<Vec<f32>> = None;
        let mut last = Vec::new();
        let mut deterministic = true;
        for iteration in 0..options.iterations {
            let output = backend
                .timed_infer(input, &mut case_timings)
                .with_context(|| format!("case {case} iteration {iteration} failed"))?;
            match &first {
                None => first = Some(output.clone()),
                Some(expected) => deterministic &= bit_identical(expected, &output),
            }
            last = output;
        }

        let comparison = compare_outputs(&last, reference, options.tolerance)
            .with_context(|| format!("case {case} produced logits of the wrong size"))?;
        if !comparison.within_tolerance {
            warn!(
                "Output mismatch. MaxDiff is {} (case {case}, index {})",
                comparison.max_abs_diff, comparison.worst_index
            );
        }
        if !deterministic {
            warn!("case {case} produced different logits across iterations");
        }
        let avg_ms = avg_duration_ms(&case_timings);
        debug!("case {case}: {avg_ms:.3} ms average, max diff {}", comparison.max_abs_diff);

        cases.push(CaseReport {
            case,
            avg_ms,
            max_abs_diff: comparison.max_abs_diff,
            worst_index: comparison.worst_index,
            within_tolerance: comparison.within_tolerance,
            deterministic,
        });
        timings.extend(case_timings);
    }

    Ok(BenchmarkSummary {
        backend: label,
        test_cases: inputs.len(),
        iterations_per_case: options.iterations,
        warmup_iterations: options.warmup_iterations,
        total_ms: sum_durations_ms(&timings),
        avg_ms: avg_duration_ms(&timings),
        min_ms: timings
            .iter()
            .map(|d| duration_to_ms(*d))
            .fold(f64::MAX, f64::min),
        max_ms: timings
            .iter()
            .map(|d| duration_to_ms(*d))
            .fold(0.0, f64::max),
        mismatches: cases.iter().filter(|c| !c.within_tolerance).count(),
        nondeterministic: cases.iter().filter(|c| !c.deterministic).count(),
        cases,
    })
}

fn bit_identical(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

fn sum_durations_ms(samples: &[Duration]) -> f64 {
    samples.iter().map(|d| duration_to_ms(*d)).sum()
}

fn avg_duration_ms(samples: &[Duration]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        sum_durations_ms(samples) / samples.len() as f64
    }
}

fn duration_to_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}
