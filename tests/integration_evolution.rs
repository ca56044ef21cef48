//! End-to-end runs of the evolution loop with scripted providers and
//! table-driven evaluators.

use std::sync::Arc;

use promptevo::budget::Budget;
use promptevo::candidate::Candidate;
use promptevo::evaluator::KeywordEvaluator;
use promptevo::evolution::{EvolutionError, EvolutionRun, EvolutionSettings, RunReport, RunStatus};
use promptevo::mutation::Strategy;
use promptevo::proposal::{ProposalGate, ProposalStatus};
use promptevo::provider::{RetryPolicy, TextGenerator};
use promptevo::rubric::{Rubric, TestInput};
use promptevo::stop_rules::{StopReason, StopRules};
use promptevo::telemetry::{MemoryTelemetry, TelemetryRecord, TelemetrySink};
use promptevo::test_helpers::{FailingGenerator, ScriptedGenerator, SequenceGenerator, TableEvaluator};

const SEED: &str = "Summarise the ticket.";
const IMPROVED: &str = "List the owner, severity and next steps for each incident report.";

fn fixture() -> (Vec<TestInput>, Rubric) {
    (
        vec![TestInput::new("triage", vec!["owner", "severity"])],
        Rubric::default(),
    )
}

fn settings(strategies: Vec<Strategy>, max_generations: Option<u32>) -> EvolutionSettings {
    EvolutionSettings {
        strategies,
        variants: 1,
        rng_seed: 1,
        workers: 1,
        stop: StopRules {
            max_generations,
            ..Default::default()
        },
        retry: RetryPolicy::none(),
        ..Default::default()
    }
}

fn generator(g: impl TextGenerator + 'static) -> Option<Arc<dyn TextGenerator>> {
    Some(Arc::new(g))
}

fn assert_budget_conserved(report: &RunReport) {
    let mut expected = report.seed_tokens;
    for g in &report.generations {
        expected += g.tokens;
        assert_eq!(g.cumulative_tokens, expected, "generation {}", g.index);
    }
    assert!(report.budget.tokens_spent >= expected);
}

#[test]
fn happy_path_crowns_new_champion_and_files_pending_proposal() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(&[(SEED, 60.0), (IMPROVED, 75.0)], 0.0);
    let gate = Arc::new(ProposalGate::in_memory());

    let report = EvolutionRun::new(
        &evaluator,
        &tests,
        &rubric,
        Budget::new(10_000, 600.0),
        settings(vec![Strategy::TextGrad], Some(1)),
    )
    .with_gate(gate.clone())
    .with_generator(generator(ScriptedGenerator::new(
        vec!["mention owner and severity", IMPROVED],
        100,
    )))
    .run(Candidate::seed(SEED))
    .unwrap();

    assert_eq!(report.status, RunStatus::BudgetExhausted);
    assert_eq!(report.seed_score, 60.0);
    assert_eq!(report.champion.score(), 75.0);
    assert_eq!(report.champion.candidate.content, IMPROVED);
    assert_eq!(report.champion.generation, 1);

    let g = &report.generations[0];
    assert_eq!(g.arm, "textgrad");
    assert!(g.became_champion);
    assert_eq!(g.delta, Some(15.0));
    assert_eq!(g.tokens, 200);

    let pending = gate.list(Some(ProposalStatus::Pending)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].candidate_id, report.champion.candidate.id);
    assert_eq!(pending[0].predicted_delta, 15.0);
    assert_eq!(report.proposals, vec![pending[0].id.clone()]);
    assert!(pending[0].diff.contains(&format!("+{}", IMPROVED)));

    let arm = &report.arms["textgrad"];
    assert_eq!(arm.pulls, 1);
    assert!((arm.mean_reward() - 0.15).abs() < 1e-9);
}

#[test]
fn all_strategies_failing_records_empty_generations() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(&[(SEED, 60.0)], 0.0);
    let failing = Arc::new(FailingGenerator::unavailable());
    let sink = Arc::new(MemoryTelemetry::new());

    let report = EvolutionRun::new(
        &evaluator,
        &tests,
        &rubric,
        Budget::new(10_000, 600.0),
        settings(vec![Strategy::TextGrad, Strategy::MetaRewrite], Some(3)),
    )
    .with_generator(Some(failing.clone() as Arc<dyn TextGenerator>))
    .with_telemetry(sink.clone())
    .run(Candidate::seed(SEED))
    .unwrap();

    assert_eq!(report.status, RunStatus::BudgetExhausted);
    assert_eq!(report.generations.len(), 3);
    for g in &report.generations {
        assert_eq!(g.candidate_id, None);
        assert_eq!(g.reward, 0.0);
        assert_eq!(g.variants_evaluated, 0);
    }
    assert_eq!(report.arms.values().map(|a| a.pulls).sum::<u64>(), 3);
    assert_eq!(report.champion.candidate.content, SEED);
    assert!(report.proposals.is_empty());
    assert_eq!(evaluator.calls(), 1);
    assert!(failing.calls() >= 3);

    let records = sink.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.candidate_id.is_none() && r.composite.is_none()));
}

#[test]
fn budget_exhaustion_mid_run_stops_after_four_generations() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(&[], 50.0);

    let report = EvolutionRun::new(
        &evaluator,
        &tests,
        &rubric,
        Budget::new(5000, 600.0),
        settings(vec![Strategy::MetaRewrite], None),
    )
    .with_generator(generator(SequenceGenerator::new("variant", 1200)))
    .run(Candidate::seed(SEED))
    .unwrap();

    assert_eq!(report.status, RunStatus::BudgetExhausted);
    assert_eq!(report.stop_reason, Some(StopReason::TokenBudget));
    assert_eq!(report.generations.len(), 4);
    assert_eq!(
        report
            .generations
            .iter()
            .map(|g| g.cumulative_tokens)
            .collect::<Vec<_>>(),
        vec![1200, 2400, 3600, 4800]
    );
    assert_eq!(report.total_tokens(), 4800);
    assert_budget_conserved(&report);
}

#[test]
fn evaluator_tokens_count_toward_the_budget() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(&[], 50.0).with_tokens_per_eval(30);

    let mut s = settings(vec![Strategy::MetaRewrite], Some(5));
    s.variants = 2;
    let report = EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(100_000, 600.0), s)
        .with_generator(generator(SequenceGenerator::new("variant", 10)))
        .run(Candidate::seed(SEED))
        .unwrap();

    assert_eq!(report.seed_tokens, 30);
    assert_eq!(report.generations.len(), 5);
    for g in &report.generations {
        // Two generator calls plus two evaluations.
        assert_eq!(g.tokens, 2 * 10 + 2 * 30);
    }
    assert_budget_conserved(&report);
    assert_eq!(report.budget.tokens_spent, 30 + 5 * 80);
}

/// Rejects every pending proposal as soon as its generation is sealed.
struct RejectingReviewer {
    gate: Arc<ProposalGate>,
}

impl TelemetrySink for RejectingReviewer {
    fn emit(&self, _record: &TelemetryRecord) {
        for p in self.gate.list(Some(ProposalStatus::Pending)).unwrap() {
            self.gate
                .decide(&p.id, ProposalStatus::Rejected, Some("not today".into()))
                .unwrap();
        }
    }
}

#[test]
fn rejected_proposals_leave_the_live_champion_alone() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(
        &[(SEED, 40.0), ("variant 1", 55.0), ("variant 2", 50.0), ("variant 3", 70.0)],
        0.0,
    );
    let gate = Arc::new(ProposalGate::in_memory());

    let report = EvolutionRun::new(
        &evaluator,
        &tests,
        &rubric,
        Budget::new(10_000, 600.0),
        settings(vec![Strategy::MetaRewrite], Some(4)),
    )
    .with_gate(gate.clone())
    .with_telemetry(Arc::new(RejectingReviewer { gate: gate.clone() }))
    .with_generator(generator(SequenceGenerator::new("variant", 1)))
    .run(Candidate::seed(SEED))
    .unwrap();

    assert_eq!(report.champion.candidate.content, "variant 3");
    assert_eq!(report.champion.score(), 70.0);
    assert_eq!(report.proposals.len(), 2);
    let all = gate.list(None).unwrap();
    assert!(all.iter().all(|p| p.status == ProposalStatus::Rejected));
    // Generation 2 is measured against the rejected generation-1 champion.
    assert_eq!(report.generations[1].delta, Some(-5.0));
    assert_eq!(report.generations[2].delta, Some(15.0));
}

#[test]
fn champion_scores_never_decrease() {
    let tests = vec![
        TestInput::new("triage", vec!["severity", "owner", "next steps"]),
        TestInput::new("summary", vec!["impact", "root cause"]),
    ];
    let rubric = Rubric::default();
    let evaluator = KeywordEvaluator::new();
    let mut s = settings(vec![Strategy::StructuralJitter, Strategy::RandomJitter], Some(12));
    s.variants = 3;
    s.workers = 3;

    let report = EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(10_000, 600.0), s)
        .run(Candidate::seed("Triage the ticket. Note the severity. Be brief."))
        .unwrap();

    assert_eq!(report.generations.len(), 12);
    let scores: Vec<f64> = report.champion_history.iter().map(|c| c.score).collect();
    assert!(scores.windows(2).all(|w| w[1] > w[0]), "{:?}", scores);
    let mut champion = report.seed_score;
    for g in &report.generations {
        if g.became_champion {
            let new = g.report.as_ref().unwrap().composite;
            assert!(new > champion);
            champion = new;
        }
    }
    assert_eq!(champion, report.champion.score());
    assert_eq!(
        report.champion_history.len(),
        1 + report.generations.iter().filter(|g| g.became_champion).count()
    );
}

#[test]
fn evaluator_error_preserves_partial_log() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(&[], 50.0).failing_on("variant 3");

    let report = EvolutionRun::new(
        &evaluator,
        &tests,
        &rubric,
        Budget::new(10_000, 600.0),
        settings(vec![Strategy::MetaRewrite], Some(10)),
    )
    .with_generator(generator(SequenceGenerator::new("variant", 5)))
    .run(Candidate::seed(SEED))
    .unwrap();

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(report.generations.len(), 2);
    assert!(report.error.as_deref().unwrap().contains("scoring blew up"));
    assert!(matches!(report.stop_reason, Some(StopReason::EvaluatorError { .. })));
    // The failed generation never reached the bandit.
    assert_eq!(report.arms["meta_rewrite"].pulls, 2);
}

#[test]
fn seed_that_cannot_be_scored_is_an_error() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(&[], 50.0).failing_on(SEED);
    let err = EvolutionRun::new(
        &evaluator,
        &tests,
        &rubric,
        Budget::new(10_000, 600.0),
        settings(vec![Strategy::MetaRewrite], Some(1)),
    )
    .run(Candidate::seed(SEED))
    .unwrap_err();
    assert!(matches!(err, EvolutionError::Evaluation(_)));
}

#[test]
fn parallel_evaluation_keeps_variant_order() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(
        &[("variant 1", 61.0), ("variant 2", 64.0), ("variant 3", 90.0), ("variant 4", 62.0)],
        10.0,
    );
    let mut s = settings(vec![Strategy::MetaRewrite], Some(1));
    s.variants = 4;
    s.workers = 4;

    let report = EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(10_000, 600.0), s)
        .with_generator(generator(SequenceGenerator::new("variant", 1)))
        .run(Candidate::seed(SEED))
        .unwrap();

    let g = &report.generations[0];
    assert_eq!(g.variants_evaluated, 4);
    assert_eq!(report.champion.candidate.content, "variant 3");
    assert_eq!(g.candidate_id.as_deref(), Some(report.champion.candidate.id.as_str()));
    assert_eq!(evaluator.calls(), 5);
}

#[test]
fn target_score_converges() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(&[("variant 1", 85.0)], 10.0);
    let mut s = settings(vec![Strategy::MetaRewrite], Some(10));
    s.stop.target_score = Some(80.0);

    let report = EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(10_000, 600.0), s)
        .with_generator(generator(SequenceGenerator::new("variant", 1)))
        .run(Candidate::seed(SEED))
        .unwrap();

    assert_eq!(report.status, RunStatus::Converged);
    assert_eq!(report.generations.len(), 1);
    assert!(matches!(report.stop_reason, Some(StopReason::TargetReached { .. })));
}

#[test]
fn stagnation_converges_after_patience() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(&[(SEED, 60.0)], 0.0);
    let mut s = settings(vec![Strategy::TextGrad], Some(20));
    s.stop.patience = Some(3);

    let report = EvolutionRun::new(&evaluator, &tests, &rubric, Budget::new(10_000, 600.0), s)
        .with_generator(generator(FailingGenerator::timeout()))
        .run(Candidate::seed(SEED))
        .unwrap();

    assert_eq!(report.status, RunStatus::Converged);
    assert_eq!(report.stop_reason, Some(StopReason::Stagnation { generations: 3 }));
    assert_eq!(report.generations.len(), 3);
}

#[test]
fn telemetry_has_one_record_per_generation_in_order() {
    let (tests, rubric) = fixture();
    let evaluator = TableEvaluator::new(&[], 50.0);
    let sink = Arc::new(MemoryTelemetry::new());

    let report = EvolutionRun::new(
        &evaluator,
        &tests,
        &rubric,
        Budget::new(10_000, 600.0),
        settings(vec![Strategy::MetaRewrite, Strategy::StructuralJitter], Some(5)),
    )
    .with_run_id("run-telemetry")
    .with_telemetry(sink.clone())
    .with_generator(generator(SequenceGenerator::new("variant", 7)))
    .run(Candidate::seed("Summarise the ticket. Name the owner. Be brief."))
    .unwrap();

    let records = sink.records();
    assert_eq!(records.len(), report.generations.len());
    for (r, g) in records.iter().zip(&report.generations) {
        assert_eq!(r.run_id, "run-telemetry");
        assert_eq!(r.generation, g.index);
        assert_eq!(r.arm, g.arm);
        assert_eq!(r.cumulative_tokens, g.cumulative_tokens);
        assert_eq!(r.candidate_id, g.candidate_id);
    }
}
