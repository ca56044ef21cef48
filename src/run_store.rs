//! Persisted run reports.
//!
//! Each finished run is written to `.promptevo/runs/<run-id>.json`. Run IDs
//! are auto-incrementing (`run-001`, `run-002`, …).

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::evolution::RunReport;

/// Directory where all run reports live.
pub fn runs_dir(dir: &Path) -> PathBuf {
    dir.join("runs")
}

pub fn report_path(dir: &Path, run_id: &str) -> PathBuf {
    runs_dir(dir).join(format!("{}.json", run_id))
}

/// Generate the next run ID by scanning existing reports.
pub fn next_run_id(dir: &Path) -> String {
    let mut max = 0u32;
    if let Ok(entries) = fs::read_dir(runs_dir(dir)) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(num_str) = name.strip_prefix("run-").and_then(|n| n.strip_suffix(".json"))
                && let Ok(num) = num_str.parse::<u32>()
            {
                max = max.max(num);
            }
        }
    }
    format!("run-{:03}", max + 1)
}

/// Write a report atomically: temp file in the same directory, then rename.
pub fn save_report(dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let runs = runs_dir(dir);
    fs::create_dir_all(&runs).context("Failed to create runs directory")?;
    let path = report_path(dir, &report.run_id);
    let tmp_path = runs.join(format!(".{}.tmp.{}", report.run_id, std::process::id()));

    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    let result = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()
    })();

    match result {
        Ok(()) => {
            fs::rename(&tmp_path, &path)
                .with_context(|| format!("Failed to write run report: {}", path.display()))?;
            Ok(path)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e).with_context(|| format!("Failed to write run report: {}", path.display()))
        }
    }
}

/// Load a report by id. `latest` resolves to the highest run id.
pub fn load_report(dir: &Path, run_id: &str) -> Result<RunReport> {
    let run_id = if run_id == "latest" {
        list_runs(dir)?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("No runs recorded yet"))?
    } else {
        run_id.to_string()
    };
    let path = report_path(dir, &run_id);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read run report: {}", path.display()))?;
    let report: RunReport = serde_json::from_str(&content).context("Failed to parse run report")?;
    Ok(report)
}

/// List all run IDs (sorted ascending).
pub fn list_runs(dir: &Path) -> Result<Vec<String>> {
    let runs = runs_dir(dir);
    if !runs.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(&runs).context("Failed to read runs directory")? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(id) = name.strip_suffix(".json")
            && id.starts_with("run-")
        {
            ids.push(id.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::evaluator::KeywordEvaluator;
    use crate::evolution::{EvolutionRun, EvolutionSettings};
    use crate::mutation::Strategy;
    use crate::rubric::{Rubric, TestInput};
    use crate::stop_rules::StopRules;
    use crate::candidate::Candidate;
    use tempfile::TempDir;

    fn report(run_id: &str) -> RunReport {
        let tests = vec![TestInput::new("t", vec!["owner"])];
        let rubric = Rubric::default();
        let evaluator = KeywordEvaluator::new();
        let settings = EvolutionSettings {
            strategies: vec![Strategy::StructuralJitter],
            stop: StopRules {
                max_generations: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(1000, 60.0), settings)
            .with_run_id(run_id)
            .run(Candidate::seed("Assign an owner. Be brief."))
            .unwrap()
    }

    #[test]
    fn test_next_run_id_empty() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(next_run_id(tmp.path()), "run-001");
    }

    #[test]
    fn test_next_run_id_increments() {
        let tmp = TempDir::new().unwrap();
        let runs = runs_dir(tmp.path());
        fs::create_dir_all(&runs).unwrap();
        fs::write(runs.join("run-001.json"), "{}").unwrap();
        fs::write(runs.join("run-003.json"), "{}").unwrap();
        fs::write(runs.join("notes.txt"), "").unwrap();
        assert_eq!(next_run_id(tmp.path()), "run-004");
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let r = report("run-001");
        let path = save_report(tmp.path(), &r).unwrap();
        assert!(path.ends_with("runs/run-001.json"));

        let loaded = load_report(tmp.path(), "run-001").unwrap();
        assert_eq!(loaded.run_id, "run-001");
        assert_eq!(loaded.generations.len(), r.generations.len());
        assert_eq!(loaded.champion.candidate.id, r.champion.candidate.id);
        assert_eq!(loaded.status, r.status);
    }

    #[test]
    fn test_list_runs_and_latest() {
        let tmp = TempDir::new().unwrap();
        save_report(tmp.path(), &report("run-002")).unwrap();
        save_report(tmp.path(), &report("run-001")).unwrap();
        fs::create_dir_all(runs_dir(tmp.path()).join("run-009")).unwrap();

        assert_eq!(list_runs(tmp.path()).unwrap(), vec!["run-001", "run-002"]);
        assert_eq!(load_report(tmp.path(), "latest").unwrap().run_id, "run-002");
    }

    #[test]
    fn test_load_missing() {
        let tmp = TempDir::new().unwrap();
        assert!(load_report(tmp.path(), "run-001").is_err());
        assert!(load_report(tmp.path(), "latest").is_err());
    }
}
