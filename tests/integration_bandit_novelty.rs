//! Bandit selection and novelty scoring seen from outside the crate.

use std::collections::BTreeSet;
use std::sync::Arc;

use promptevo::bandit::{Bandit, DEFAULT_EXPLORATION, RewardPolicy};
use promptevo::candidate::Candidate;
use promptevo::evaluator::{Evaluator, KeywordEvaluator};
use promptevo::mutation::Strategy;
use promptevo::novelty::{HashingEmbedder, NoveltyDetector};
use promptevo::rubric::{Rubric, TestInput};

fn four_arm_bandit() -> Bandit {
    Bandit::new(Strategy::ALL.iter().map(|s| s.name()), DEFAULT_EXPLORATION).unwrap()
}

#[test]
fn cold_start_tries_every_arm_before_repeating() {
    let mut bandit = four_arm_bandit();
    let mut seen = BTreeSet::new();
    for _ in 0..4 {
        let arm = bandit.select_arm().to_string();
        assert!(seen.insert(arm.clone()), "{} repeated during cold start", arm);
        bandit.update(&arm, 0.0).unwrap();
    }
    assert_eq!(seen.len(), 4);
}

#[test]
fn rewarded_arm_is_exploited_but_others_are_revisited() {
    let mut bandit = four_arm_bandit();
    let mut pulls = std::collections::BTreeMap::new();
    for _ in 0..200 {
        let arm = bandit.select_arm().to_string();
        let reward = if arm == "textgrad" { 0.8 } else { 0.05 };
        bandit.update(&arm, reward).unwrap();
        *pulls.entry(arm).or_insert(0u32) += 1;
    }
    let best = pulls["textgrad"];
    assert!(pulls.values().all(|&p| p >= 1));
    assert!(pulls.iter().all(|(name, &p)| name == "textgrad" || p < best));
    assert_eq!(bandit.total_pulls(), 200);
}

#[test]
fn mean_reward_is_derived_from_totals() {
    let mut bandit = four_arm_bandit();
    bandit.update("meta_rewrite", 0.5).unwrap();
    bandit.update("meta_rewrite", 2.0).unwrap();
    let arm = bandit.arm("meta_rewrite").unwrap();
    assert_eq!(arm.pulls, 2);
    assert_eq!(arm.cumulative_reward, 1.5);
    assert_eq!(arm.mean_reward(), 0.75);
}

#[test]
fn reward_clips_and_penalises_repeats() {
    let policy = RewardPolicy::default();
    assert_eq!(policy.reward(15.0, 0.9), 0.15);
    assert_eq!(policy.reward(-10.0, 0.9), 0.0);
    assert_eq!(policy.reward(250.0, 0.9), 1.0);
    assert_eq!(policy.reward(20.0, 0.1), 0.1);
}

#[test]
fn novelty_boundaries() {
    let detector = NoveltyDetector::new(Arc::new(HashingEmbedder::default()));
    let c = Candidate::seed("Triage the ticket and name the owner.");
    assert_eq!(detector.novelty(&c, &[]).unwrap(), 1.0);
    let twin = Candidate::derive(&c, 1, "structural_jitter", c.content.clone());
    assert_eq!(detector.novelty(&c, &[&twin]).unwrap(), 0.0);

    let other = Candidate::seed("Write a haiku about autumn leaves.");
    let n = detector.novelty(&other, &[&c]).unwrap();
    assert!(n > 0.5, "unrelated text should be novel, got {}", n);
}

#[test]
fn keyword_evaluation_is_repeatable() {
    let tests = vec![
        TestInput::new("triage", vec!["owner", "severity|priority"]),
        TestInput::new("summary", vec!["next steps"]),
    ];
    let rubric = Rubric::default();
    let c = Candidate::seed("Name the owner and the priority. Close with next steps.");
    let evaluator = KeywordEvaluator::new();
    let a = evaluator.evaluate(&c, &tests, &rubric).unwrap();
    let b = evaluator.evaluate(&c, &tests, &rubric).unwrap();
    assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    assert_eq!(a.accuracy, 100.0);
}
