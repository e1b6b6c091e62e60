//! Common helpers shared across the MobileNet benchmark crates.

/// Benchmark settings (JSON-serializable).
pub mod config;
/// Shared GPU context initialization and buffer pooling.
pub mod gpu;
/// Instrumentation helpers for optional stage timing.
pub mod telemetry;
/// Whitespace-separated float file readers and writers.
pub mod text_io;

use std::path::Path;

use anyhow::Result;
use log::LevelFilter;

pub use config::{
    Backend, BenchSettings, ExecutionSettings, GpuSettings, InputDimensions, TelemetrySettings,
};
pub use gpu::{
    BufferPoolError, GpuAvailability, GpuBufferPool, GpuContext, GpuContextOptions, GpuInitError,
};
pub use telemetry::{
    TimingGuard, configure as configure_telemetry, telemetry_allows, telemetry_enabled,
    telemetry_level, timing_guard, timing_guard_if,
};
pub use text_io::{parse_float_records, read_float_records, write_float_records};

/// Initialize logging once for the benchmark binary and tests.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies. The telemetry
/// target is always let through so that enabling telemetry in settings is
/// enough to see stage timings.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(telemetry::TELEMETRY_TARGET, LevelFilter::Trace);

    // A logger may already be installed by an earlier call or a test harness.
    let _ = builder.try_init();
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
