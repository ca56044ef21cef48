//! `pevo run-evolution`: evolve a seed prompt and file proposals for review.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use promptevo::candidate::{Candidate, short_id};
use promptevo::config::{Config, Credentials};
use promptevo::evolution::{EvolutionRun, RunReport, RunStatus};
use promptevo::rubric::RubricFile;
use promptevo::run_store;
use promptevo::telemetry::JsonlTelemetry;

use super::open_gate;

/// Command-line overrides on top of config.toml.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub seed: Option<String>,
    pub seed_file: Option<PathBuf>,
    pub rubric: Option<PathBuf>,
    pub max_tokens: Option<u64>,
    pub max_generations: Option<u32>,
    pub max_seconds: Option<f64>,
    pub variants: Option<usize>,
    pub rng_seed: Option<u64>,
    pub strategies: Vec<String>,
    pub patience: Option<u32>,
    pub save: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(t) = self.max_tokens {
            config.budget.max_tokens = t;
        }
        if let Some(g) = self.max_generations {
            config.budget.max_generations = Some(g);
        }
        if let Some(s) = self.max_seconds {
            config.budget.max_seconds = s;
        }
        if let Some(v) = self.variants {
            config.evolution.variants = v;
        }
        if let Some(seed) = self.rng_seed {
            config.evolution.rng_seed = Some(seed);
        }
        if !self.strategies.is_empty() {
            config.evolution.strategies = self.strategies.clone();
        }
        if let Some(p) = self.patience {
            config.evolution.patience = Some(p);
        }
    }

    fn seed_text(&self) -> Result<String> {
        let text = match (&self.seed, &self.seed_file) {
            (Some(s), _) => s.clone(),
            (None, Some(path)) => fs::read_to_string(path)
                .with_context(|| format!("Failed to read seed file: {}", path.display()))?,
            (None, None) => anyhow::bail!("Provide a seed prompt with --seed or --seed-file"),
        };
        if text.trim().is_empty() {
            anyhow::bail!("Seed prompt is empty");
        }
        Ok(text)
    }
}

pub fn run(dir: &Path, args: RunArgs, json: bool) -> Result<RunStatus> {
    let gate = Arc::new(open_gate(dir)?);
    let mut config = Config::load(dir)?;
    args.apply(&mut config);
    let seed = Candidate::seed(args.seed_text()?);

    let rubric_path = args.rubric.clone().unwrap_or_else(|| dir.join("rubric.yaml"));
    let mut file = RubricFile::load(&rubric_path)
        .with_context(|| format!("Failed to load rubric: {}", rubric_path.display()))?;
    config.evaluator.apply(&mut file.rubric);

    let creds = Credentials::load().unwrap_or_else(|e| {
        warn!(error = %e, "could not load credentials; continuing without");
        Credentials::default()
    });
    let generator = config.text_generator(&creds)?;
    let embedder = config.embedder(&creds)?;
    let evaluator = config.evaluator(generator.clone())?;
    let settings = config.evolution_settings()?;
    let run_id = run_store::next_run_id(dir);

    let report = EvolutionRun::new(
        evaluator.as_ref(),
        &file.tests,
        &file.rubric,
        config.budget(),
        settings,
    )
    .with_run_id(run_id.clone())
    .with_gate(gate)
    .with_telemetry(Arc::new(JsonlTelemetry::in_dir(dir)))
    .with_embedder(embedder)
    .with_generator(generator)
    .run(seed)
    .with_context(|| format!("Run {} could not start", run_id))?;

    if args.save {
        run_store::save_report(dir, &report)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&report))?);
    } else {
        print_summary(&report);
    }
    Ok(report.status)
}

fn summary_json(report: &RunReport) -> serde_json::Value {
    serde_json::json!({
        "run_id": report.run_id,
        "status": report.status,
        "stop_reason": report.stop_reason,
        "error": report.error,
        "champion_id": report.champion.candidate.id,
        "champion_score": report.champion.score(),
        "seed_score": report.seed_score,
        "generations": report.generations.len(),
        "tokens": report.total_tokens(),
        "rng_seed": report.rng_seed,
        "proposals": report.proposals,
    })
}

fn print_summary(report: &RunReport) {
    println!("Run {}: {}", report.run_id, report.status);
    if let Some(ref reason) = report.stop_reason {
        println!("  Stopped: {}", reason);
    }
    if let Some(ref error) = report.error {
        println!("  Error: {}", error);
    }
    println!(
        "  Champion: {} (score {:.1}, seed {:.1}, {:+.1})",
        short_id(&report.champion.candidate.id),
        report.champion.score(),
        report.seed_score,
        report.improvement()
    );
    println!(
        "  Generations: {}, tokens: {}, rng seed: {}",
        report.generations.len(),
        report.total_tokens(),
        report.rng_seed
    );
    if report.proposals.is_empty() {
        println!("  No proposals filed.");
    } else {
        println!("  Pending proposals ({}):", report.proposals.len());
        for id in &report.proposals {
            println!("    {}", id);
        }
        println!("  Review with 'pevo proposals review'.");
    }
}
