//! Opt-in timing telemetry for forward-pass stages.
//!
//! A [`TimingGuard`] measures a scoped operation and logs the duration on the
//! `mobilenet::telemetry` target when it drops. Guards only activate when
//! telemetry has been switched on through [`configure`] and the global logger
//! accepts the requested level, so the benchmark loop pays one relaxed atomic
//! load per stage when profiling is off.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, log, log_enabled};

pub const TELEMETRY_TARGET: &str = "mobilenet::telemetry";

static TELEMETRY_ENABLED: AtomicBool = AtomicBool::new(false);
static TELEMETRY_LEVEL: AtomicU8 = AtomicU8::new(0);

/// RAII helper that logs how long an operation took when dropped.
pub struct TimingGuard {
    label: Cow<'static, str>,
    level: Level,
    start: Instant,
    active: bool,
}

impl TimingGuard {
    fn new(label: Cow<'static, str>, level: Level, active: bool) -> Self {
        Self {
            label,
            level,
            start: Instant::now(),
            active,
        }
    }

    /// Returns `true` when the guard will emit a log entry on drop.
    ///
    /// Callers timing asynchronous GPU work use this to decide whether to
    /// synchronize the device before the guard drops.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns the elapsed duration since the guard was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Consume the guard and return the elapsed duration without logging.
    pub fn finish(mut self) -> Duration {
        self.active = false;
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if self.active {
            log!(
                target: TELEMETRY_TARGET,
                self.level,
                "{} completed in {:.3?}",
                self.label,
                self.start.elapsed()
            );
        }
    }
}

/// Create a timing guard that logs at `level` whenever telemetry allows it.
pub fn timing_guard(label: impl Into<Cow<'static, str>>, level: Level) -> TimingGuard {
    timing_guard_if(label, level, true)
}

/// Create a timing guard that additionally requires `enabled` to be set.
pub fn timing_guard_if(
    label: impl Into<Cow<'static, str>>,
    level: Level,
    enabled: bool,
) -> TimingGuard {
    let active =
        enabled && telemetry_allows(level) && log_enabled!(target: TELEMETRY_TARGET, level);
    TimingGuard::new(label.into(), level, active)
}

/// Configure the global telemetry state.
pub fn configure(enabled: bool, level: LevelFilter) {
    TELEMETRY_ENABLED.store(enabled, Ordering::Relaxed);
    TELEMETRY_LEVEL.store(filter_rank(level), Ordering::Relaxed);
}

/// Returns whether telemetry logging is currently enabled.
pub fn telemetry_enabled() -> bool {
    TELEMETRY_ENABLED.load(Ordering::Relaxed)
}

/// Returns the maximum telemetry logging level.
pub fn telemetry_level() -> LevelFilter {
    LevelFilter::iter()
        .find(|filter| filter_rank(*filter) == TELEMETRY_LEVEL.load(Ordering::Relaxed))
        .unwrap_or(LevelFilter::Off)
}

/// Returns `true` when telemetry is enabled and `level` is within the configured threshold.
pub fn telemetry_allows(level: Level) -> bool {
    telemetry_enabled()
        && filter_rank(level.to_level_filter()) <= TELEMETRY_LEVEL.load(Ordering::Relaxed)
}

fn filter_rank(filter: LevelFilter) -> u8 {
    match filter {
        LevelFilter::Off => 0,
        LevelFilter::Error => 1,
        LevelFilter::Warn => 2,
        LevelFilter::Info => 3,
        LevelFilter::Debug => 4,
        LevelFilter::Trace => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Telemetry state is process-global, so everything touching it lives in one test.
    #[test]
    fn configure_controls_guard_activation() {
        configure(false, LevelFilter::Trace);
        assert!(!telemetry_enabled());
        assert!(!telemetry_allows(Level::Error));
        assert!(!timing_guard("disabled", Level::Info).is_active());

        configure(true, LevelFilter::Info);
        assert!(telemetry_enabled());
        assert_eq!(telemetry_level(), LevelFilter::Info);
        assert!(telemetry_allows(Level::Warn));
        assert!(telemetry_allows(Level::Info));
        assert!(!telemetry_allows(Level::Debug));
        assert!(!timing_guard_if("opted-out", Level::Info, false).is_active());

        configure(false, LevelFilter::Off);
        assert_eq!(telemetry_level(), LevelFilter::Off);
    }

    #[test]
    fn finish_reports_elapsed_time() {
        let guard = timing_guard("finish", Level::Trace);
        std::thread::sleep(Duration::from_millis(2));
        assert!(guard.finish() >= Duration::from_millis(2));
    }
}
