//! The evolution loop.
//!
//! One [`EvolutionRun`] owns everything a run mutates: bandit, budget,
//! candidate archive, evaluation history and generation log. Nothing is
//! process-global, so several runs can proceed side by side.
//!
//! ```text
//! INITIALIZED --seed scored--> RUNNING --+--> BUDGET_EXHAUSTED
//!                                        +--> CONVERGED
//!                                        +--> ERROR
//! ```
//!
//! Each generation: select arm, mutate the champion, evaluate the variants in
//! parallel, pick the best, update the bandit once, maybe crown a new
//! champion (which files a pending proposal), seal the generation, emit
//! telemetry, charge the budget.

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bandit::{Arm, Bandit, BanditError, DEFAULT_EXPLORATION, RewardPolicy};
use crate::budget::Budget;
use crate::candidate::{Candidate, CandidateArchive, short_id};
use crate::evaluator::{EvaluationError, EvaluationHistory, Evaluator, ScoreReport, validate_inputs};
use crate::mutation::{MutationContext, Strategy};
use crate::novelty::{Embedder, HashingEmbedder, NoveltyDetector};
use crate::proposal::{ProposalDraft, ProposalError, ProposalGate};
use crate::provider::{RetryPolicy, TextGenerator};
use crate::rubric::{Rubric, TestInput};
use crate::stop_rules::{Observation, StopReason, StopRules};
use crate::telemetry::{NullTelemetry, TelemetryRecord, TelemetrySink};

#[derive(Error, Debug)]
pub enum EvolutionError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("seed evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Bandit(#[from] BanditError),
    #[error(transparent)]
    Proposal(#[from] ProposalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Initialized,
    Running,
    BudgetExhausted,
    Converged,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::BudgetExhausted | RunStatus::Converged | RunStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initialized => "INITIALIZED",
            RunStatus::Running => "RUNNING",
            RunStatus::BudgetExhausted => "BUDGET_EXHAUSTED",
            RunStatus::Converged => "CONVERGED",
            RunStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status a stop reason leads to.
fn status_for(reason: &StopReason) -> RunStatus {
    match reason {
        StopReason::TokenBudget | StopReason::TimeBudget | StopReason::GenerationLimit { .. } => {
            RunStatus::BudgetExhausted
        }
        StopReason::TargetReached { .. }
        | StopReason::Stagnation { .. }
        | StopReason::SafetyPlateau { .. } => RunStatus::Converged,
        StopReason::EvaluatorError { .. } => RunStatus::Error,
    }
}

/// One sealed iteration of the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// 1-based; the seed evaluation is generation 0 and has no entry.
    pub index: u32,
    pub arm: String,
    /// Best variant of the generation; `None` when the strategy produced nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ScoreReport>,
    pub variants_evaluated: usize,
    /// Best composite minus the champion's composite at generation start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    pub reward: f64,
    pub became_champion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<String>,
    pub tokens: u64,
    pub cumulative_tokens: u64,
    pub elapsed_ms: u64,
    pub sealed_at: DateTime<Utc>,
}

impl Generation {
    fn observation(&self) -> Observation {
        Observation {
            composite: self.report.as_ref().map(|r| r.composite),
            robustness: self.report.as_ref().map(|r| r.robustness),
            became_champion: self.became_champion,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Champion {
    pub candidate: Candidate,
    pub report: ScoreReport,
    /// Generation at which it took over (0 for the seed).
    pub generation: u32,
}

impl Champion {
    pub fn score(&self) -> f64 {
        self.report.composite
    }
}

/// Entry in the champion succession.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionChange {
    pub candidate_id: String,
    pub score: f64,
    pub generation: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Failure detail for `ERROR` runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub seed_id: String,
    pub seed_score: f64,
    pub seed_tokens: u64,
    /// Seed of the mutation RNG; rerunning with it reproduces the jitter arms.
    #[serde(default)]
    pub rng_seed: u64,
    pub generations: Vec<Generation>,
    pub champion: Champion,
    pub champion_history: Vec<ChampionChange>,
    /// Ids of proposals filed during the run, in order.
    pub proposals: Vec<String>,
    pub arms: BTreeMap<String, Arm>,
    pub budget: Budget,
    /// Every candidate produced, seed first.
    pub candidates: Vec<Candidate>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn total_tokens(&self) -> u64 {
        self.generations
            .last()
            .map(|g| g.cumulative_tokens)
            .unwrap_or(self.seed_tokens)
    }

    pub fn improvement(&self) -> f64 {
        self.champion.score() - self.seed_score
    }
}

/// Knobs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct EvolutionSettings {
    /// Arms offered to the bandit.
    pub strategies: Vec<Strategy>,
    /// Variants requested per generation.
    pub variants: usize,
    pub exploration: f64,
    pub rng_seed: u64,
    /// Threads evaluating one generation's variants.
    pub workers: usize,
    pub reward: RewardPolicy,
    pub stop: StopRules,
    pub retry: RetryPolicy,
    pub provider_timeout: Duration,
    pub max_tokens: u32,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            strategies: Strategy::ALL.to_vec(),
            variants: 3,
            exploration: DEFAULT_EXPLORATION,
            rng_seed: 0,
            workers: 4,
            reward: RewardPolicy::default(),
            stop: StopRules::default(),
            retry: RetryPolicy::default(),
            provider_timeout: Duration::from_secs(60),
            max_tokens: 512,
        }
    }
}

impl EvolutionSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.strategies.is_empty() {
            return Err("at least one strategy is required".to_string());
        }
        if self.variants == 0 {
            return Err("variants per generation must be at least 1".to_string());
        }
        if !self.exploration.is_finite() || self.exploration < 0.0 {
            return Err(format!(
                "exploration constant must be a non-negative number, got {}",
                self.exploration
            ));
        }
        if !(0.0..=1.0).contains(&self.reward.novelty_penalty) {
            return Err(format!(
                "novelty penalty must be within 0..=1, got {}",
                self.reward.novelty_penalty
            ));
        }
        Ok(())
    }
}

fn default_run_id() -> String {
    format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S%3f"))
}

/// Run context. Build with [`EvolutionRun::new`], attach collaborators with
/// the `with_*` methods, then call [`EvolutionRun::run`].
pub struct EvolutionRun<'a> {
    run_id: String,
    evaluator: &'a dyn Evaluator,
    tests: &'a [TestInput],
    rubric: &'a Rubric,
    budget: Budget,
    settings: EvolutionSettings,
    bandit: Option<Bandit>,
    gate: Arc<ProposalGate>,
    telemetry: Arc<dyn TelemetrySink>,
    novelty: NoveltyDetector,
    generator: Option<Arc<dyn TextGenerator>>,
}

impl<'a> EvolutionRun<'a> {
    pub fn new(
        evaluator: &'a dyn Evaluator,
        tests: &'a [TestInput],
        rubric: &'a Rubric,
        budget: Budget,
        settings: EvolutionSettings,
    ) -> Self {
        Self {
            run_id: default_run_id(),
            evaluator,
            tests,
            rubric,
            budget,
            settings,
            bandit: None,
            gate: Arc::new(ProposalGate::in_memory()),
            telemetry: Arc::new(NullTelemetry),
            novelty: NoveltyDetector::new(Arc::new(HashingEmbedder::default())),
            generator: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Continue from a checkpointed bandit instead of a fresh one.
    pub fn with_bandit(mut self, bandit: Bandit) -> Self {
        self.bandit = Some(bandit);
        self
    }

    pub fn with_gate(mut self, gate: Arc<ProposalGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.novelty = NoveltyDetector::new(embedder);
        self
    }

    pub fn with_generator(mut self, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        self.generator = generator;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn prepare_bandit(&mut self) -> Result<Bandit, EvolutionError> {
        let names: Vec<&str> = self.settings.strategies.iter().map(|s| s.name()).collect();
        match self.bandit.take() {
            Some(b) => {
                let arms: Vec<&str> = b.stats().keys().map(String::as_str).collect();
                let mut expected = names.clone();
                expected.sort_unstable();
                expected.dedup();
                if arms != expected {
                    return Err(EvolutionError::InvalidConfiguration(format!(
                        "bandit arms [{}] do not match strategies [{}]",
                        arms.join(", "),
                        expected.join(", ")
                    )));
                }
                Ok(b)
            }
            None => Ok(Bandit::new(names, self.settings.exploration)?),
        }
    }

    fn validate(&self) -> Result<(), EvolutionError> {
        let invalid = EvolutionError::InvalidConfiguration;
        validate_inputs(self.tests, self.rubric).map_err(|e| match e {
            EvaluationError::InvalidConfiguration(m) | EvaluationError::Internal(m) => invalid(m),
        })?;
        self.budget.validate().map_err(invalid)?;
        self.settings.validate().map_err(invalid)?;
        Ok(())
    }

    /// Evaluate variants on up to `workers` threads; results keep input order.
    fn evaluate_all(&self, variants: &[Candidate]) -> Vec<Result<ScoreReport, EvaluationError>> {
        let (evaluator, tests, rubric) = (self.evaluator, self.tests, self.rubric);
        let workers = self.settings.workers.max(1);
        if workers == 1 || variants.len() <= 1 {
            return variants
                .iter()
                .map(|v| evaluator.evaluate(v, tests, rubric))
                .collect();
        }
        let chunk = variants.len().div_ceil(workers);
        thread::scope(|s| {
            let handles: Vec<_> = variants
                .chunks(chunk)
                .map(|part| {
                    s.spawn(move || {
                        part.iter()
                            .map(|v| evaluator.evaluate(v, tests, rubric))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| {
                    h.join().unwrap_or_else(|_| {
                        vec![Err(EvaluationError::Internal(
                            "evaluation worker panicked".to_string(),
                        ))]
                    })
                })
                .collect()
        })
    }

    fn novelty_against(&self, candidate: &Candidate, archive: &CandidateArchive) -> f64 {
        let history: Vec<&Candidate> = archive.iter().collect();
        match self.novelty.novelty(candidate, &history) {
            Ok(n) => n,
            Err(e) => {
                warn!(candidate = short_id(&candidate.id), error = %e, "embedding failed; treating candidate as novel");
                1.0
            }
        }
    }

    /// Execute the run from `seed` until a terminal state.
    ///
    /// Configuration problems and a seed that cannot be scored are returned
    /// as `Err` before the loop starts. Evaluator failures later in the run
    /// end it in `ERROR` with every sealed generation preserved.
    pub fn run(mut self, seed: Candidate) -> Result<RunReport, EvolutionError> {
        let started_at = Utc::now();
        self.validate()?;
        let mut bandit = self.prepare_bandit()?;
        let strategies: BTreeMap<&'static str, Strategy> = self
            .settings
            .strategies
            .iter()
            .map(|s| (s.name(), *s))
            .collect();
        let mut rng = StdRng::seed_from_u64(self.settings.rng_seed);
        let mut budget = self.budget.clone();

        info!(
            run_id = %self.run_id,
            seed = short_id(&seed.id),
            rng_seed = self.settings.rng_seed,
            arms = strategies.len(),
            "evaluating seed"
        );
        let t0 = Instant::now();
        let before = self.evaluator.tokens_consumed();
        let seed_report = self.evaluator.evaluate(&seed, self.tests, self.rubric)?;
        let seed_tokens = self.evaluator.tokens_consumed().saturating_sub(before);
        budget.charge(seed_tokens, t0.elapsed());

        let mut archive = CandidateArchive::new();
        let mut history = EvaluationHistory::default();
        archive.insert(seed.clone());
        history.push(seed_report.clone());
        let seed_id = seed.id.clone();
        let seed_score = seed_report.composite;
        let mut champion = Champion {
            candidate: seed,
            report: seed_report,
            generation: 0,
        };
        let mut champion_history = vec![ChampionChange {
            candidate_id: champion.candidate.id.clone(),
            score: champion.score(),
            generation: 0,
        }];

        let mut status = RunStatus::Running;
        let mut stop_reason: Option<StopReason> = None;
        let mut error: Option<String> = None;
        let mut generations: Vec<Generation> = Vec::new();
        let mut observations: Vec<Observation> = Vec::new();
        let mut proposals: Vec<String> = Vec::new();
        info!(run_id = %self.run_id, score = seed_score, "run started");

        while status == RunStatus::Running {
            if let Err(limit) = budget.allows_next() {
                stop_reason = Some(limit.into());
                break;
            }
            if let Some(reason) = self.settings.stop.check(champion.score(), &observations) {
                stop_reason = Some(reason);
                break;
            }

            let index = generations.len() as u32 + 1;
            let started = Instant::now();
            let arm = bandit.select_arm().to_string();
            let Some(strategy) = strategies.get(arm.as_str()).copied() else {
                return Err(BanditError::UnknownArm(arm).into());
            };
            let feedback = champion.report.missing_concepts();
            let evaluator_before = self.evaluator.tokens_consumed();
            let variants = {
                let mut ctx = MutationContext {
                    generation: index,
                    rng: &mut rng,
                    feedback: &feedback,
                    generator: self.generator.as_deref(),
                    retry: self.settings.retry,
                    timeout: self.settings.provider_timeout,
                    max_tokens: self.settings.max_tokens,
                };
                strategy.mutate(&champion.candidate, self.settings.variants, &mut ctx)
            };
            debug!(generation = index, %arm, variants = variants.candidates.len(), "mutated");

            let results = self.evaluate_all(&variants.candidates);
            let tokens = variants.tokens_used
                + self.evaluator.tokens_consumed().saturating_sub(evaluator_before);

            let mut reports = Vec::with_capacity(results.len());
            let mut failure = None;
            for r in results {
                match r {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failure {
                warn!(run_id = %self.run_id, generation = index, error = %e, "evaluator failed; stopping run");
                budget.charge(tokens, started.elapsed());
                stop_reason = Some(StopReason::EvaluatorError {
                    message: e.to_string(),
                });
                error = Some(e.to_string());
                status = RunStatus::Error;
                break;
            }

            // Novelty is measured against everything seen before this generation.
            let reports: Vec<ScoreReport> = variants
                .candidates
                .iter()
                .zip(reports)
                .map(|(c, r)| {
                    let n = self.novelty_against(c, &archive);
                    r.with_novelty(n)
                })
                .collect();

            let best = reports
                .iter()
                .enumerate()
                .fold(None::<usize>, |best, (i, r)| match best {
                    Some(b)
                        if reports[b].composite > r.composite
                            || (reports[b].composite == r.composite
                                && reports[b].novelty >= r.novelty) =>
                    {
                        Some(b)
                    }
                    _ => Some(i),
                });

            let prior_score = champion.score();
            let (delta, reward) = match best {
                Some(i) => {
                    let d = reports[i].composite - prior_score;
                    (Some(d), self.settings.reward.reward(d, reports[i].novelty))
                }
                None => (None, 0.0),
            };
            bandit.update(&arm, reward)?;

            for (c, r) in variants.candidates.iter().zip(&reports) {
                archive.insert(c.clone());
                history.push(r.clone());
            }

            let mut became_champion = false;
            let mut proposal_id = None;
            if let Some(i) = best
                && reports[i].composite > prior_score
            {
                let winner = variants.candidates[i].clone();
                let report = reports[i].clone();
                let rationale = format!(
                    "{} raised the composite from {:.1} to {:.1} in generation {}",
                    arm, prior_score, report.composite, index
                );
                let filed = self.gate.propose_draft(ProposalDraft {
                    run_id: Some(&self.run_id),
                    candidate: &winner,
                    prior_champion: Some(&champion.candidate),
                    predicted_delta: report.composite - prior_score,
                    score: Some(report.composite),
                    rationale,
                });
                match filed {
                    Ok(id) => {
                        proposals.push(id.clone());
                        proposal_id = Some(id);
                    }
                    Err(e) => {
                        warn!(run_id = %self.run_id, error = %e, "failed to file proposal; stopping run");
                        error = Some(format!("proposal store: {}", e));
                        status = RunStatus::Error;
                    }
                }
                info!(
                    run_id = %self.run_id,
                    generation = index,
                    candidate = short_id(&winner.id),
                    score = report.composite,
                    "new champion"
                );
                champion_history.push(ChampionChange {
                    candidate_id: winner.id.clone(),
                    score: report.composite,
                    generation: index,
                });
                champion = Champion {
                    candidate: winner,
                    report,
                    generation: index,
                };
                became_champion = true;
            }
            let champion_id = champion.candidate.id.clone();
            for c in &variants.candidates {
                if c.id != champion_id {
                    archive.prune(&c.id);
                }
            }

            let elapsed = started.elapsed();
            budget.record(tokens, elapsed);
            let winner_report = best.map(|i| reports[i].clone());
            let generation = Generation {
                index,
                arm: arm.clone(),
                candidate_id: best.map(|i| variants.candidates[i].id.clone()),
                variants_evaluated: reports.len(),
                delta,
                reward,
                became_champion,
                proposal_id,
                tokens,
                cumulative_tokens: budget.tokens_spent,
                elapsed_ms: elapsed.as_millis() as u64,
                sealed_at: Utc::now(),
                report: winner_report,
            };
            self.telemetry.emit(&TelemetryRecord {
                timestamp: generation.sealed_at,
                run_id: self.run_id.clone(),
                generation: index,
                arm,
                candidate_id: generation.candidate_id.clone(),
                composite: generation.report.as_ref().map(|r| r.composite),
                delta,
                reward,
                tokens,
                cumulative_tokens: generation.cumulative_tokens,
                latency_ms: generation.elapsed_ms,
                novelty: generation.report.as_ref().map(|r| r.novelty),
                became_champion,
                budget: budget.flags(),
            });
            debug!(
                generation = index,
                reward,
                tokens,
                cumulative = generation.cumulative_tokens,
                "generation sealed"
            );
            observations.push(generation.observation());
            generations.push(generation);
        }

        if status == RunStatus::Running {
            status = stop_reason
                .as_ref()
                .map(status_for)
                .unwrap_or(RunStatus::BudgetExhausted);
        }
        info!(
            run_id = %self.run_id,
            %status,
            generations = generations.len(),
            champion = short_id(&champion.candidate.id),
            score = champion.score(),
            tokens = budget.tokens_spent,
            "run finished"
        );

        Ok(RunReport {
            run_id: self.run_id,
            status,
            stop_reason,
            error,
            seed_id,
            seed_score,
            seed_tokens,
            rng_seed: self.settings.rng_seed,
            generations,
            champion,
            champion_history,
            proposals,
            arms: bandit.stats().clone(),
            budget,
            candidates: archive.iter().cloned().collect(),
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::KeywordEvaluator;
    use crate::telemetry::MemoryTelemetry;

    fn tests_and_rubric() -> (Vec<TestInput>, Rubric) {
        (
            vec![
                TestInput::new("triage", vec!["severity", "owner"]),
                TestInput::new("summary", vec!["next steps"]),
            ],
            Rubric::default(),
        )
    }

    fn settings(strategies: Vec<Strategy>, max_generations: u32) -> EvolutionSettings {
        EvolutionSettings {
            strategies,
            variants: 2,
            rng_seed: 7,
            workers: 2,
            stop: StopRules {
                max_generations: Some(max_generations),
                ..Default::default()
            },
            retry: RetryPolicy::none(),
            ..Default::default()
        }
    }

    #[test]
    fn offline_run_is_deterministic() {
        let (tests, rubric) = tests_and_rubric();
        let evaluator = KeywordEvaluator::new();
        let offline = vec![Strategy::StructuralJitter, Strategy::RandomJitter];
        let run = |seed: u64| {
            let mut s = settings(offline.clone(), 6);
            s.rng_seed = seed;
            EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(10_000, 600.0), s)
                .with_run_id("r")
                .run(Candidate::seed("Triage the ticket. Name the severity."))
                .unwrap()
        };
        let a = run(3);
        let b = run(3);
        assert_eq!(a.generations.len(), 6);
        let ids = |r: &RunReport| {
            r.generations
                .iter()
                .map(|g| g.candidate_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.champion.candidate.content, b.champion.candidate.content);
    }

    #[test]
    fn report_records_rng_seed() {
        let (tests, rubric) = tests_and_rubric();
        let evaluator = KeywordEvaluator::new();
        let mut s = settings(vec![Strategy::RandomJitter], 2);
        s.rng_seed = 4242;
        let report = EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(10_000, 600.0), s)
            .run(Candidate::seed("Triage the ticket. Name the severity."))
            .unwrap();
        assert_eq!(report.rng_seed, 4242);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rng_seed"], 4242);
    }

    #[test]
    fn generation_limit_ends_budget_exhausted() {
        let (tests, rubric) = tests_and_rubric();
        let evaluator = KeywordEvaluator::new();
        let report = EvolutionRun::new(
            &evaluator,
            &tests,
            &rubric,
            Budget::new(10_000, 600.0),
            settings(vec![Strategy::StructuralJitter], 3),
        )
        .run(Candidate::seed("Triage the ticket."))
        .unwrap();
        assert_eq!(report.status, RunStatus::BudgetExhausted);
        assert_eq!(report.stop_reason, Some(StopReason::GenerationLimit { max: 3 }));
        assert_eq!(
            report.generations.iter().map(|g| g.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn llm_strategies_without_generator_yield_empty_generations() {
        let (tests, rubric) = tests_and_rubric();
        let evaluator = KeywordEvaluator::new();
        let sink = Arc::new(MemoryTelemetry::new());
        let report = EvolutionRun::new(
            &evaluator,
            &tests,
            &rubric,
            Budget::new(10_000, 600.0),
            settings(vec![Strategy::TextGrad, Strategy::MetaRewrite], 4),
        )
        .with_telemetry(sink.clone())
        .run(Candidate::seed("Triage the ticket."))
        .unwrap();
        assert_eq!(report.generations.len(), 4);
        for g in &report.generations {
            assert!(g.candidate_id.is_none());
            assert_eq!(g.reward, 0.0);
            assert!(!g.became_champion);
        }
        assert_eq!(report.arms["textgrad"].pulls, 2);
        assert_eq!(report.arms["meta_rewrite"].pulls, 2);
        assert_eq!(report.champion.candidate.id, report.seed_id);
        assert_eq!(sink.records().len(), 4);
    }

    #[test]
    fn invalid_configuration_never_runs() {
        let (tests, rubric) = tests_and_rubric();
        let evaluator = KeywordEvaluator::new();
        let seed = || Candidate::seed("x");
        let s = || settings(vec![Strategy::StructuralJitter], 1);

        let err = EvolutionRun::new(&evaluator, &[], &rubric, Budget::new(10, 1.0), s())
            .run(seed())
            .unwrap_err();
        assert!(matches!(err, EvolutionError::InvalidConfiguration(_)));

        let err = EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(0, 1.0), s())
            .run(seed())
            .unwrap_err();
        assert!(matches!(err, EvolutionError::InvalidConfiguration(_)));

        let mut bad = s();
        bad.variants = 0;
        let err = EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(10, 1.0), bad)
            .run(seed())
            .unwrap_err();
        assert!(matches!(err, EvolutionError::InvalidConfiguration(_)));
    }

    #[test]
    fn checkpointed_bandit_must_match_strategies() {
        let (tests, rubric) = tests_and_rubric();
        let evaluator = KeywordEvaluator::new();
        let bandit = Bandit::new(["textgrad"], DEFAULT_EXPLORATION).unwrap();
        let err = EvolutionRun::new(
            &evaluator,
            &tests,
            &rubric,
            Budget::new(100, 1.0),
            settings(vec![Strategy::StructuralJitter], 1),
        )
        .with_bandit(bandit)
        .run(Candidate::seed("x"))
        .unwrap_err();
        assert!(matches!(err, EvolutionError::InvalidConfiguration(_)));
    }

    #[test]
    fn zero_generation_limit_returns_seed_as_champion() {
        let (tests, rubric) = tests_and_rubric();
        let evaluator = KeywordEvaluator::new();
        let report = EvolutionRun::new(
            &evaluator,
            &tests,
            &rubric,
            Budget::new(100, 1.0),
            settings(vec![Strategy::StructuralJitter], 0),
        )
        .run(Candidate::seed("Name the severity and owner."))
        .unwrap();
        assert!(report.generations.is_empty());
        assert_eq!(report.champion.generation, 0);
        assert_eq!(report.champion_history.len(), 1);
        assert_eq!(report.total_tokens(), 0);
    }

    #[test]
    fn status_strings() {
        assert_eq!(RunStatus::BudgetExhausted.to_string(), "BUDGET_EXHAUSTED");
        assert_eq!(
            serde_json::to_string(&RunStatus::Converged).unwrap(),
            "\"CONVERGED\""
        );
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Error.is_terminal());
    }
}
