//! Token and wall-clock budget for one run.
//!
//! The loop asks [`Budget::allows_next`] before starting a generation. A
//! generation is never started once either ceiling is reached, or when the
//! running per-generation average predicts it would overshoot.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fraction of a ceiling below which the remaining budget is flagged as low.
pub const DEFAULT_WARN_FRACTION: f64 = 0.2;

/// Low-budget warnings attached to telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetFlags {
    pub tokens_low: bool,
    pub time_low: bool,
}

/// Which ceiling stopped the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    Tokens,
    Time,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub max_tokens: u64,
    pub max_seconds: f64,
    pub tokens_spent: u64,
    pub seconds_elapsed: f64,
    /// Generations recorded so far.
    pub generations: u32,
    #[serde(default = "default_warn_fraction")]
    pub warn_fraction: f64,
    /// Spend outside any generation (the seed evaluation).
    #[serde(default)]
    pub setup_tokens: u64,
    #[serde(default)]
    pub setup_seconds: f64,
}

fn default_warn_fraction() -> f64 {
    DEFAULT_WARN_FRACTION
}

impl Budget {
    pub fn new(max_tokens: u64, max_seconds: f64) -> Self {
        Self {
            max_tokens,
            max_seconds,
            tokens_spent: 0,
            seconds_elapsed: 0.0,
            generations: 0,
            warn_fraction: DEFAULT_WARN_FRACTION,
            setup_tokens: 0,
            setup_seconds: 0.0,
        }
    }

    pub fn with_warn_fraction(mut self, fraction: f64) -> Self {
        self.warn_fraction = fraction;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_tokens == 0 {
            return Err("budget max_tokens must be greater than 0".to_string());
        }
        if !self.max_seconds.is_finite() || self.max_seconds <= 0.0 {
            return Err(format!(
                "budget max_seconds must be greater than 0, got {}",
                self.max_seconds
            ));
        }
        if !(0.0..=1.0).contains(&self.warn_fraction) {
            return Err(format!(
                "budget warn_fraction must be within 0..=1, got {}",
                self.warn_fraction
            ));
        }
        Ok(())
    }

    /// Account for one sealed generation.
    pub fn record(&mut self, tokens: u64, elapsed: Duration) {
        self.tokens_spent = self.tokens_spent.saturating_add(tokens);
        self.seconds_elapsed += elapsed.as_secs_f64();
        self.generations += 1;
    }

    /// Account for spend that belongs to no generation. It counts against
    /// the ceilings but not toward the per-generation prediction.
    pub fn charge(&mut self, tokens: u64, elapsed: Duration) {
        self.tokens_spent = self.tokens_spent.saturating_add(tokens);
        self.seconds_elapsed += elapsed.as_secs_f64();
        self.setup_tokens = self.setup_tokens.saturating_add(tokens);
        self.setup_seconds += elapsed.as_secs_f64();
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.max_tokens.saturating_sub(self.tokens_spent)
    }

    pub fn remaining_seconds(&self) -> f64 {
        (self.max_seconds - self.seconds_elapsed).max(0.0)
    }

    /// The ceiling already reached, if any.
    pub fn exhausted(&self) -> Option<BudgetLimit> {
        if self.tokens_spent >= self.max_tokens {
            Some(BudgetLimit::Tokens)
        } else if self.seconds_elapsed >= self.max_seconds {
            Some(BudgetLimit::Time)
        } else {
            None
        }
    }

    /// Mean tokens per recorded generation (0 before the first).
    pub fn predicted_tokens(&self) -> u64 {
        if self.generations == 0 {
            0
        } else {
            self.tokens_spent.saturating_sub(self.setup_tokens) / self.generations as u64
        }
    }

    pub fn predicted_seconds(&self) -> f64 {
        if self.generations == 0 {
            0.0
        } else {
            (self.seconds_elapsed - self.setup_seconds).max(0.0) / self.generations as f64
        }
    }

    /// `Ok(())` if another generation fits, otherwise the ceiling it would
    /// reach or overshoot.
    pub fn allows_next(&self) -> Result<(), BudgetLimit> {
        if let Some(limit) = self.exhausted() {
            return Err(limit);
        }
        if self.tokens_spent + self.predicted_tokens() > self.max_tokens {
            return Err(BudgetLimit::Tokens);
        }
        if self.seconds_elapsed + self.predicted_seconds() > self.max_seconds {
            return Err(BudgetLimit::Time);
        }
        Ok(())
    }

    pub fn flags(&self) -> BudgetFlags {
        BudgetFlags {
            tokens_low: (self.remaining_tokens() as f64) < self.warn_fraction * self.max_tokens as f64,
            time_low: self.remaining_seconds() < self.warn_fraction * self.max_seconds,
        }
    }
}
