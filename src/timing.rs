//! Phase timing for sandbox boots.
//!
//! Enabled with `PLAYGROUND_TIMING=1` or [`enable_timing`]. Reports go to
//! the `playground::timing` tracing target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static TIMING_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable_timing() {
    TIMING_ENABLED.store(true, Ordering::SeqCst);
}

pub fn is_timing_enabled() -> bool {
    TIMING_ENABLED.load(Ordering::SeqCst)
        || std::env::var("PLAYGROUND_TIMING").is_ok_and(|value| value == "1")
}

/// Collects phase durations for one operation on one sandbox.
pub struct TimingReport {
    operation: &'static str,
    sandbox_id: String,
    start: Instant,
    phase_start: Instant,
    phases: Vec<(&'static str, Duration)>,
}

impl TimingReport {
    pub fn new(operation: &'static str, sandbox_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            operation,
            sandbox_id: sandbox_id.into(),
            start: now,
            phase_start: now,
            phases: Vec::new(),
        }
    }

    pub fn set_sandbox(&mut self, sandbox_id: impl Into<String>) {
        self.sandbox_id = sandbox_id.into();
    }

    /// Closes the current phase under `phase` and starts the next one.
    pub fn mark(&mut self, phase: &'static str) {
        let now = Instant::now();
        self.phases.push((phase, now - self.phase_start));
        self.phase_start = now;
    }

    pub fn phases(&self) -> &[(&'static str, Duration)] {
        &self.phases
    }

    pub fn render(&self) -> String {
        let total = self.start.elapsed();
        let mut output = format!(
            "{} sandbox={} total={:.2}ms",
            self.operation,
            self.sandbox_id,
            total.as_secs_f64() * 1000.0
        );
        for (phase, duration) in &self.phases {
            let pct = if total.as_nanos() > 0 {
                (duration.as_nanos() as f64 / total.as_nanos() as f64) * 100.0
            } else {
                0.0
            };
            output.push_str(&format!(
                "\n  {:24} {:>8.2}ms ({:>5.1}%)",
                phase,
                duration.as_secs_f64() * 1000.0,
                pct
            ));
        }
        output
    }

    pub fn finish(self) {
        if is_timing_enabled() {
            tracing::info!(target: "playground::timing", "{}", self.render());
        }
    }
}
