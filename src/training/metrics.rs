//! Running statistics for training and evaluation loops
//!
//! A [`MetricLogger`] lives for one epoch. Each micro-batch updates its
//! meters locally; [`MetricLogger::synchronize_between_processes`] then sums
//! every meter's total and count across workers exactly once, after which
//! all workers report identical global averages.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use tracing::info;

use crate::distributed::ExecutionContext;
use crate::error::Result;

/// Window length used when a meter is registered implicitly
pub const DEFAULT_WINDOW: usize = 20;

/// Windowed running statistic with a global weighted average
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: f64,
    precision: usize,
    global_only: bool,
}

impl SmoothedValue {
    /// Meter showing `median (global_avg)`
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0.0,
            precision: 4,
            global_only: false,
        }
    }

    /// Meter that displays only its current value, e.g. the learning rate
    pub fn value_only(window_size: usize, precision: usize) -> Self {
        Self {
            precision,
            global_only: true,
            ..Self::new(window_size)
        }
    }

    /// Record `value` with weight `n`
    pub fn update(&mut self, value: f64, n: usize) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += n as f64;
        self.total += value * n as f64;
    }

    /// Weighted mean over everything recorded; NaN when empty
    pub fn global_avg(&self) -> f64 {
        self.total / self.count
    }

    /// Weighted sum of recorded values
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Sum of weights
    pub fn count(&self) -> f64 {
        self.count
    }

    /// Median of the window
    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return f64::NAN;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted[(sorted.len() - 1) / 2]
    }

    /// Unweighted mean of the window
    pub fn avg(&self) -> f64 {
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Maximum of the window
    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NAN, f64::max)
    }

    /// Most recent value
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(f64::NAN)
    }

    fn reduce_buffer(&self) -> [f64; 2] {
        [self.count, self.total]
    }

    fn apply_reduced(&mut self, reduced: &[f64]) {
        self.count = reduced[0];
        self.total = reduced[1];
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.precision;
        if self.global_only {
            write!(f, "{:.*}", p, self.value())
        } else {
            write!(f, "{:.*} ({:.*})", p, self.median(), p, self.global_avg())
        }
    }
}

/// Named meters for one epoch
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    delimiter: String,
    started: Instant,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    /// Create an empty logger
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            meters: BTreeMap::new(),
            delimiter: delimiter.into(),
            started: Instant::now(),
        }
    }

    /// Register a meter with non-default display settings
    pub fn add_meter(&mut self, name: impl Into<String>, meter: SmoothedValue) {
        self.meters.insert(name.into(), meter);
    }

    /// Record `value` with weight `n`, registering the meter on first use
    pub fn update(&mut self, name: &str, value: f64, n: usize) {
        self.meters
            .entry(name.to_string())
            .or_insert_with(|| SmoothedValue::new(DEFAULT_WINDOW))
            .update(value, n);
    }

    /// Meter by name
    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    /// Sum every meter's total and count across workers
    ///
    /// Meters are reduced in name order, so every worker must have
    /// registered the same set of meters.
    pub fn synchronize_between_processes(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if !ctx.is_distributed() {
            return Ok(());
        }
        let mut buffer: Vec<f64> = self.meters.values().flat_map(SmoothedValue::reduce_buffer).collect();
        ctx.collective().all_reduce_sum(&mut buffer)?;
        for (meter, reduced) in self.meters.values_mut().zip(buffer.chunks_exact(2)) {
            meter.apply_reduced(reduced);
        }
        Ok(())
    }

    /// Global averages keyed by meter name
    pub fn global_averages(&self) -> HashMap<String, f64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }

    /// One-line summary of every meter's global average
    pub fn summary(&self) -> String {
        self.meters
            .iter()
            .map(|(name, meter)| format!("{}: {:.3}", name, meter.global_avg()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Emit a progress line every `print_freq` steps and on the last step
    pub fn log_progress(&self, header: &str, step: usize, total: usize, print_freq: usize) {
        if total == 0 || (step % print_freq.max(1) != 0 && step + 1 != total) {
            return;
        }
        let elapsed = self.started.elapsed();
        let per_step = elapsed.as_secs_f64() / (step + 1) as f64;
        let eta = Duration::from_secs_f64(per_step * (total - step - 1) as f64);
        let width = total.to_string().len();
        let step = format!("{:>width$}", step, width = width);
        info!(
            "{} [{}/{}]{}eta: {}{}{}",
            header,
            step,
            total,
            self.delimiter,
            format_duration(eta),
            self.delimiter,
            self
        );
    }

    /// Emit the end-of-pass timing line
    pub fn log_total_time(&self, header: &str, steps: usize) {
        let elapsed = self.started.elapsed();
        info!(
            "{} Total time: {} ({:.4} s / it)",
            header,
            format_duration(elapsed),
            elapsed.as_secs_f64() / steps.max(1) as f64
        );
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .meters
            .iter()
            .map(|(name, meter)| format!("{}: {}", name, meter))
            .collect();
        f.write_str(&parts.join(&self.delimiter))
    }
}

/// `H:MM:SS`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
