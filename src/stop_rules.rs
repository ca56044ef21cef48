//! Stop conditions checked after every sealed generation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::budget::BudgetLimit;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum StopReason {
    TokenBudget,
    TimeBudget,
    GenerationLimit { max: u32 },
    TargetReached { score: f64, target: f64 },
    Stagnation { generations: u32 },
    /// Composite rose while robustness fell; a human should review.
    SafetyPlateau { composite_delta: f64, robustness_delta: f64 },
    EvaluatorError { message: String },
}

impl From<BudgetLimit> for StopReason {
    fn from(limit: BudgetLimit) -> Self {
        match limit {
            BudgetLimit::Tokens => StopReason::TokenBudget,
            BudgetLimit::Time => StopReason::TimeBudget,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TokenBudget => write!(f, "token budget exhausted"),
            StopReason::TimeBudget => write!(f, "time budget exhausted"),
            StopReason::GenerationLimit { max } => write!(f, "generation limit {} reached", max),
            StopReason::TargetReached { score, target } => {
                write!(f, "target reached ({:.1} >= {:.1})", score, target)
            }
            StopReason::Stagnation { generations } => {
                write!(f, "no improvement for {} generations", generations)
            }
            StopReason::SafetyPlateau {
                composite_delta,
                robustness_delta,
            } => write!(
                f,
                "safety plateau: composite {:+.1}, robustness {:+.1}; human review required",
                composite_delta, robustness_delta
            ),
            StopReason::EvaluatorError { message } => write!(f, "evaluator error: {}", message),
        }
    }
}

/// What the rules see of one sealed generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Composite of the generation's best variant, if any.
    pub composite: Option<f64>,
    pub robustness: Option<f64>,
    pub became_champion: bool,
}

const PLATEAU_WINDOW: usize = 3;
const PLATEAU_COMPOSITE_RISE: f64 = 1.0;
const PLATEAU_ROBUSTNESS_DROP: f64 = 10.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopRules {
    #[serde(default)]
    pub max_generations: Option<u32>,
    #[serde(default)]
    pub target_score: Option<f64>,
    /// Stop after this many consecutive generations without a new champion.
    #[serde(default)]
    pub patience: Option<u32>,
    #[serde(default)]
    pub safety_plateau: bool,
}

impl StopRules {
    /// Check the rules against the log so far, in order: generation limit,
    /// target, stagnation, safety plateau.
    pub fn check(&self, champion_score: f64, log: &[Observation]) -> Option<StopReason> {
        if let Some(max) = self.max_generations
            && log.len() as u64 >= max as u64
        {
            return Some(StopReason::GenerationLimit { max });
        }
        if let Some(target) = self.target_score
            && champion_score >= target
        {
            return Some(StopReason::TargetReached {
                score: champion_score,
                target,
            });
        }
        if let Some(k) = self.patience
            && k > 0
            && log.len() >= k as usize
            && log[log.len() - k as usize..].iter().all(|o| !o.became_champion)
        {
            return Some(StopReason::Stagnation { generations: k });
        }
        if self.safety_plateau {
            return safety_plateau(log);
        }
        None
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn safety_plateau(log: &[Observation]) -> Option<StopReason> {
    let scored: Vec<(f64, f64)> = log
        .iter()
        .filter_map(|o| Some((o.composite?, o.robustness?)))
        .collect();
    if scored.len() < 2 * PLATEAU_WINDOW {
        return None;
    }
    let recent = &scored[scored.len() - PLATEAU_WINDOW..];
    let prior = &scored[scored.len() - 2 * PLATEAU_WINDOW..scored.len() - PLATEAU_WINDOW];
    let split = |w: &[(f64, f64)]| -> (Vec<f64>, Vec<f64>) { w.iter().copied().unzip() };
    let (recent_c, recent_r) = split(recent);
    let (prior_c, prior_r) = split(prior);
    let composite_delta = mean(&recent_c) - mean(&prior_c);
    let robustness_delta = mean(&recent_r) - mean(&prior_r);
    if composite_delta > PLATEAU_COMPOSITE_RISE && robustness_delta < -PLATEAU_ROBUSTNESS_DROP {
        Some(StopReason::SafetyPlateau {
            composite_delta,
            robustness_delta,
        })
    } else {
        None
    }
}
