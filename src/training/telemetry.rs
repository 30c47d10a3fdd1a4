//! Scalar telemetry and the per-epoch training log
//!
//! Scalars are keyed by `epoch_1000x`, the fractional epoch scaled by
//! 1000, so curves from runs with different batch sizes share one axis.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Result;

/// Name of the per-epoch log file
pub const EPOCH_LOG: &str = "log.txt";

/// Name of the telemetry event file
pub const TELEMETRY_LOG: &str = "telemetry.jsonl";

/// Logical x-axis position of micro-batch `step` of `len` in `epoch`
pub fn epoch_1000x(step: usize, len: usize, epoch: usize) -> u64 {
    ((step as f64 / len.max(1) as f64 + epoch as f64) * 1000.0) as u64
}

/// One scalar observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    /// Series name, e.g. `loss` or `perf/auc_avg`
    pub tag: String,
    /// Observed value
    pub value: f64,
    /// Position on the `epoch_1000x` axis
    pub step: u64,
    /// Seconds since the Unix epoch
    pub wall_time: f64,
}

/// Destination for (name, scalar, step) triples
pub trait TelemetrySink: Send {
    /// Record one scalar
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;

    /// Persist buffered events
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn event(tag: &str, value: f64, step: u64) -> ScalarEvent {
    let now = Utc::now();
    ScalarEvent {
        tag: tag.to_string(),
        value,
        step,
        wall_time: now.timestamp_micros() as f64 / 1e6,
    }
}

/// Appends events as JSON lines under a log directory
pub struct JsonlTelemetry {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTelemetry {
    /// Open (or create) `<log_dir>/telemetry.jsonl` for appending
    pub fn create(log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(TELEMETRY_LOG);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("log_dir: {}", log_dir.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Event file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonlTelemetry {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let line = serde_json::to_string(&event(tag, value, step))?;
        writeln!(self.writer, "{}", line)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlTelemetry {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush telemetry to {}: {}", self.path.display(), e);
        }
    }
}

/// Keeps events in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryTelemetry {
    events: Arc<Mutex<Vec<ScalarEvent>>>,
}

impl MemoryTelemetry {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events in order
    pub fn events(&self) -> Vec<ScalarEvent> {
        self.events.lock().clone()
    }

    /// Recorded events with `tag`
    pub fn series(&self, tag: &str) -> Vec<(u64, f64)> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.tag == tag)
            .map(|e| (e.step, e.value))
            .collect()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.events.lock().push(event(tag, value, step));
        Ok(())
    }
}

/// Build the JSON object logged for one epoch
///
/// Train statistics are prefixed `train_`, test statistics `test_`.
pub fn epoch_log_entry(
    train_stats: &HashMap<String, f64>,
    test_stats: Option<&Map<String, Value>>,
    epoch: usize,
    n_parameters: Option<usize>,
) -> Map<String, Value> {
    let mut entry = Map::new();

    let mut train: Vec<(&String, &f64)> = train_stats.iter().collect();
    train.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in train {
        entry.insert(format!("train_{}", k), serde_json::json!(v));
    }
    if let Some(test) = test_stats {
        for (k, v) in test {
            entry.insert(format!("test_{}", k), v.clone());
        }
    }
    entry.insert("epoch".to_string(), Value::from(epoch));
    if let Some(n) = n_parameters {
        entry.insert("n_parameters".to_string(), Value::from(n));
    }
    entry
}

/// Append one JSON line to `<output_dir>/log.txt`
pub fn append_epoch_log(output_dir: &Path, entry: &Map<String, Value>) -> Result<()> {
    fs::create_dir_all(output_dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output_dir.join(EPOCH_LOG))?;
    writeln!(file, "{}", serde_json::to_string(entry)?)?;
    Ok(())
}

/// Read every entry of an epoch log, skipping blank lines
pub fn read_epoch_log(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// One row of the plotted series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochSummary {
    /// Epoch index
    pub epoch: usize,
    /// Mean training loss
    pub train_loss: Option<f64>,
    /// Mean test AUROC, when the epoch was evaluated
    pub test_auc_avg: Option<f64>,
}

/// Extract the `train_loss` / `test_auc_avg` series from log entries
pub fn summarize_epoch_log(entries: &[Map<String, Value>]) -> Vec<EpochSummary> {
    entries
        .iter()
        .filter_map(|entry| {
            let epoch = entry.get("epoch")?.as_u64()? as usize;
            Some(EpochSummary {
                epoch,
                train_loss: entry.get("train_loss").and_then(Value::as_f64),
                test_auc_avg: entry.get("test_auc_avg").and_then(Value::as_f64),
            })
        })
        .collect()
}
