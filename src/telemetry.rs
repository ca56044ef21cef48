//! Per-generation telemetry.
//!
//! One newline-delimited JSON record per sealed generation. The JSONL sink
//! opens with `O_APPEND`, so concurrent runs writing the same file never
//! interleave partial lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::budget::BudgetFlags;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub generation: u32,
    pub arm: String,
    /// Best variant of the generation, if any was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<f64>,
    /// Composite delta over the champion at the start of the generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    pub reward: f64,
    pub tokens: u64,
    pub cumulative_tokens: u64,
    /// Wall-clock duration of the generation.
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novelty: Option<f64>,
    pub became_champion: bool,
    pub budget: BudgetFlags,
}

/// Where sealed generations are reported. Emission is best-effort; a sink
/// that fails must not stop a run.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, record: &TelemetryRecord);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn emit(&self, _record: &TelemetryRecord) {}
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn emit(&self, record: &TelemetryRecord) {
        if let Ok(mut r) = self.records.lock() {
            r.push(record.clone());
        }
    }
}

/// Appends records to a JSONL file.
#[derive(Debug, Clone)]
pub struct JsonlTelemetry {
    path: PathBuf,
}

impl JsonlTelemetry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/telemetry.jsonl`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("telemetry.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonlTelemetry {
    fn emit(&self, record: &TelemetryRecord) {
        let line = match serde_json::to_string(record) {
            Ok(json) => json + "\n",
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize telemetry record");
                return;
            }
        };
        if let Some(parent) = self.path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            tracing::warn!(path = ?parent, error = %e, "failed to create telemetry dir");
            return;
        }
        if let Err(e) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
        {
            tracing::warn!(path = ?self.path, error = %e, "failed to write telemetry");
        }
    }
}

/// Read every well-formed record from a telemetry file, optionally for one
/// run. Malformed lines are skipped.
pub fn read_records(path: &Path, run_id: Option<&str>) -> std::io::Result<Vec<TelemetryRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| serde_json::from_str::<TelemetryRecord>(&line).ok())
        .filter(|r| run_id.is_none_or(|id| r.run_id == id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(run: &str, generation: u32) -> TelemetryRecord {
        TelemetryRecord {
            timestamp: Utc::now(),
            run_id: run.to_string(),
            generation,
            arm: "textgrad".to_string(),
            candidate_id: Some("abc".to_string()),
            composite: Some(70.0),
            delta: Some(10.0),
            reward: 0.1,
            tokens: 1200,
            cumulative_tokens: 1200 * generation as u64,
            latency_ms: 42,
            novelty: Some(0.8),
            became_champion: true,
            budget: BudgetFlags::default(),
        }
    }

    #[test]
    fn jsonl_appends_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlTelemetry::in_dir(&dir.path().join("nested"));
        sink.emit(&record("r1", 1));
        sink.emit(&record("r1", 2));
        sink.emit(&record("r2", 1));
        let content = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content.lines().count(), 3);
        let r1 = read_records(sink.path(), Some("r1")).unwrap();
        assert_eq!(r1.iter().map(|r| r.generation).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn reader_skips_garbage_and_missing_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        assert!(read_records(&path, None).unwrap().is_empty());
        let good = serde_json::to_string(&record("r", 1)).unwrap();
        fs::write(&path, format!("{}\nnot json\n{}\n", good, good)).unwrap();
        assert_eq!(read_records(&path, None).unwrap().len(), 2);
    }

    #[test]
    fn empty_generation_omits_candidate_fields() {
        let mut r = record("r", 1);
        r.candidate_id = None;
        r.composite = None;
        r.delta = None;
        r.novelty = None;
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("candidate_id"));
        assert!(json.contains("\"reward\":0.1"));
    }
}
