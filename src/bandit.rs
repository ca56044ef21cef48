//! UCB1 bandit over mutation strategies.
//!
//! Every arm is pulled once before UCB scoring applies. Ties are broken by
//! the lowest pull count, then by strategy name, so selection is fully
//! deterministic given the same reward sequence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BanditError {
    #[error("unknown arm '{0}'")]
    UnknownArm(String),
    #[error("bandit has no arms")]
    NoArms,
    #[error("reward must be a finite number, got {0}")]
    InvalidReward(f64),
}

/// Default exploration constant, `sqrt(2)`.
pub const DEFAULT_EXPLORATION: f64 = std::f64::consts::SQRT_2;

/// Running statistics for one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    pub name: String,
    pub pulls: u64,
    pub cumulative_reward: f64,
}

impl Arm {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pulls: 0,
            cumulative_reward: 0.0,
        }
    }

    /// `cumulative_reward / pulls`, or 0 before the first pull.
    pub fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.cumulative_reward / self.pulls as f64
        }
    }
}

/// Serializable bandit state for explicit checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditSnapshot {
    pub exploration: f64,
    pub arms: Vec<Arm>,
}

#[derive(Debug, Clone)]
pub struct Bandit {
    arms: BTreeMap<String, Arm>,
    exploration: f64,
}

impl Bandit {
    pub fn new<I, S>(names: I, exploration: f64) -> Result<Self, BanditError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let arms: BTreeMap<String, Arm> = names
            .into_iter()
            .map(|n| {
                let n = n.into();
                (n.clone(), Arm::new(n))
            })
            .collect();
        if arms.is_empty() {
            return Err(BanditError::NoArms);
        }
        Ok(Self { arms, exploration })
    }

    pub fn exploration(&self) -> f64 {
        self.exploration
    }

    pub fn total_pulls(&self) -> u64 {
        self.arms.values().map(|a| a.pulls).sum()
    }

    pub fn arm(&self, name: &str) -> Option<&Arm> {
        self.arms.get(name)
    }

    /// UCB1 score of `arm` given `total` pulls across all arms.
    pub fn ucb(&self, arm: &Arm, total: u64) -> f64 {
        if arm.pulls == 0 {
            return f64::INFINITY;
        }
        let ln_total = (total.max(1) as f64).ln();
        arm.mean_reward() + self.exploration * (ln_total / arm.pulls as f64).sqrt()
    }

    /// Pick the next arm to pull.
    pub fn select_arm(&self) -> &str {
        // Any unpulled arm first, in name order.
        if let Some(arm) = self.arms.values().find(|a| a.pulls == 0) {
            debug!(arm = %arm.name, "cold-start selection");
            return &arm.name;
        }
        let total = self.total_pulls();
        let mut best: Option<(&Arm, f64)> = None;
        for arm in self.arms.values() {
            let score = self.ucb(arm, total);
            best = match best {
                None => Some((arm, score)),
                Some((b, bs)) => {
                    if score > bs || (score == bs && arm.pulls < b.pulls) {
                        Some((arm, score))
                    } else {
                        Some((b, bs))
                    }
                }
            };
        }
        // `arms` is non-empty by construction.
        let (arm, score) = best.unwrap_or_else(|| unreachable!("bandit has at least one arm"));
        debug!(arm = %arm.name, ucb = score, total, "ucb selection");
        &arm.name
    }

    /// Record one pull of `name` with `reward`, clamped to [0,1].
    pub fn update(&mut self, name: &str, reward: f64) -> Result<(), BanditError> {
        if !reward.is_finite() {
            return Err(BanditError::InvalidReward(reward));
        }
        let arm = self
            .arms
            .get_mut(name)
            .ok_or_else(|| BanditError::UnknownArm(name.to_string()))?;
        arm.pulls += 1;
        arm.cumulative_reward += reward.clamp(0.0, 1.0);
        Ok(())
    }

    /// All arms keyed by name.
    pub fn stats(&self) -> &BTreeMap<String, Arm> {
        &self.arms
    }

    pub fn checkpoint(&self) -> BanditSnapshot {
        BanditSnapshot {
            exploration: self.exploration,
            arms: self.arms.values().cloned().collect(),
        }
    }

    pub fn restore(snapshot: BanditSnapshot) -> Result<Self, BanditError> {
        let arms: BTreeMap<String, Arm> = snapshot
            .arms
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();
        if arms.is_empty() {
            return Err(BanditError::NoArms);
        }
        for arm in arms.values() {
            if !arm.cumulative_reward.is_finite() {
                return Err(BanditError::InvalidReward(arm.cumulative_reward));
            }
        }
        Ok(Self {
            arms,
            exploration: snapshot.exploration,
        })
    }
}

/// Maps a generation's score delta to a bandit reward.
///
/// `reward = clamp(delta / scale, 0, 1)`, halved (by `novelty_penalty`) when
/// the winning variant's novelty is below `novelty_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardPolicy {
    pub scale: f64,
    pub novelty_threshold: f64,
    pub novelty_penalty: f64,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            scale: 100.0,
            novelty_threshold: 0.2,
            novelty_penalty: 0.5,
        }
    }
}

impl RewardPolicy {
    pub fn reward(&self, delta: f64, novelty: f64) -> f64 {
        if !delta.is_finite() || self.scale <= 0.0 {
            return 0.0;
        }
        let base = (delta / self.scale).clamp(0.0, 1.0);
        if novelty < self.novelty_threshold {
            base * self.novelty_penalty
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const ARMS: [&str; 4] = ["textgrad", "structural_jitter", "random_jitter", "meta_rewrite"];

    #[test]
    fn cold_start_pulls_every_arm_once() {
        let mut b = Bandit::new(ARMS, DEFAULT_EXPLORATION).unwrap();
        let mut seen = BTreeSet::new();
        for _ in 0..4 {
            let arm = b.select_arm().to_string();
            assert!(seen.insert(arm.clone()), "arm {} repeated during cold start", arm);
            b.update(&arm, 0.0).unwrap();
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn cold_start_order_is_lexicographic() {
        let mut b = Bandit::new(ARMS, DEFAULT_EXPLORATION).unwrap();
        let mut order = Vec::new();
        for _ in 0..4 {
            let arm = b.select_arm().to_string();
            b.update(&arm, 0.5).unwrap();
            order.push(arm);
        }
        assert_eq!(order, vec!["meta_rewrite", "random_jitter", "structural_jitter", "textgrad"]);
    }

    #[test]
    fn exploits_best_arm_after_cold_start() {
        let mut b = Bandit::new(["a", "b"], 0.1).unwrap();
        b.update("a", 0.9).unwrap();
        b.update("b", 0.1).unwrap();
        assert_eq!(b.select_arm(), "a");
    }

    #[test]
    fn ties_prefer_fewer_pulls_then_name() {
        let mut b = Bandit::new(["b", "a"], DEFAULT_EXPLORATION).unwrap();
        b.update("a", 0.0).unwrap();
        b.update("b", 0.0).unwrap();
        // Equal pulls, equal rewards: name order.
        assert_eq!(b.select_arm(), "a");
    }

    #[test]
    fn mean_reward_is_derived() {
        let mut b = Bandit::new(["x"], DEFAULT_EXPLORATION).unwrap();
        assert_eq!(b.arm("x").unwrap().mean_reward(), 0.0);
        b.update("x", 0.2).unwrap();
        b.update("x", 0.6).unwrap();
        let arm = b.arm("x").unwrap();
        assert_eq!(arm.pulls, 2);
        assert!((arm.mean_reward() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn update_clamps_and_validates() {
        let mut b = Bandit::new(["x"], DEFAULT_EXPLORATION).unwrap();
        b.update("x", 5.0).unwrap();
        b.update("x", -3.0).unwrap();
        assert_eq!(b.arm("x").unwrap().cumulative_reward, 1.0);
        assert_eq!(b.update("y", 0.1), Err(BanditError::UnknownArm("y".to_string())));
        assert!(matches!(b.update("x", f64::NAN), Err(BanditError::InvalidReward(_))));
        assert_eq!(b.arm("x").unwrap().pulls, 2);
    }

    #[test]
    fn empty_bandit_is_rejected() {
        assert_eq!(Bandit::new(Vec::<String>::new(), 1.0).unwrap_err(), BanditError::NoArms);
    }

    #[test]
    fn checkpoint_restores_selection_state() {
        let mut b = Bandit::new(ARMS, DEFAULT_EXPLORATION).unwrap();
        for (i, arm) in ARMS.iter().enumerate() {
            b.update(arm, i as f64 / 4.0).unwrap();
        }
        let json = serde_json::to_string(&b.checkpoint()).unwrap();
        let restored = Bandit::restore(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.stats(), b.stats());
        assert_eq!(restored.select_arm(), b.select_arm());
    }

    #[test]
    fn reward_policy_scales_clips_and_penalises() {
        let p = RewardPolicy::default();
        assert!((p.reward(15.0, 1.0) - 0.15).abs() < 1e-12);
        assert_eq!(p.reward(-4.0, 1.0), 0.0);
        assert_eq!(p.reward(250.0, 1.0), 1.0);
        assert!((p.reward(15.0, 0.1) - 0.075).abs() < 1e-12);
        assert!((p.reward(15.0, 0.2) - 0.15).abs() < 1e-12);
    }
}
