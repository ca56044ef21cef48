//! Mutation strategies.
//!
//! The set of strategies is closed: [`Strategy`] is the arm key the bandit
//! knows at construction time, and [`Strategy::mutate`] is the one interface
//! the loop depends on. Model-backed strategies return no variants when the
//! generator is missing or keeps failing; the loop treats that as an empty
//! pool, not an error.

use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::candidate::Candidate;
use crate::provider::{RetryPolicy, TextGenerator, retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Critique the baseline against evaluator feedback, then rewrite it.
    #[serde(rename = "textgrad")]
    TextGrad,
    /// Reorder sentences and restructure sections.
    StructuralJitter,
    /// Word-level perturbation plus hints for missing concepts.
    RandomJitter,
    /// One-shot full rewrite by the model.
    MetaRewrite,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::TextGrad,
        Strategy::StructuralJitter,
        Strategy::RandomJitter,
        Strategy::MetaRewrite,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::TextGrad => "textgrad",
            Strategy::StructuralJitter => "structural_jitter",
            Strategy::RandomJitter => "random_jitter",
            Strategy::MetaRewrite => "meta_rewrite",
        }
    }

    pub fn requires_generator(&self) -> bool {
        matches!(self, Strategy::TextGrad | Strategy::MetaRewrite)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "textgrad" | "text_grad" => Ok(Strategy::TextGrad),
            "structural_jitter" | "structural" => Ok(Strategy::StructuralJitter),
            "random_jitter" | "random" => Ok(Strategy::RandomJitter),
            "meta_rewrite" | "meta" => Ok(Strategy::MetaRewrite),
            other => Err(format!(
                "unknown strategy '{}' (expected one of: textgrad, structural_jitter, random_jitter, meta_rewrite)",
                other
            )),
        }
    }
}

/// Everything a strategy may use besides the baseline.
pub struct MutationContext<'a> {
    pub generation: u32,
    pub rng: &'a mut StdRng,
    /// Expected concepts the current champion is missing.
    pub feedback: &'a [String],
    pub generator: Option<&'a dyn TextGenerator>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub max_tokens: u32,
}

/// Output of one mutate call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variants {
    pub candidates: Vec<Candidate>,
    /// Provider tokens spent producing them.
    pub tokens_used: u64,
}

impl Variants {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Extra attempts per requested variant before giving up on distinctness.
const ATTEMPTS_PER_VARIANT: usize = 4;

impl Strategy {
    /// Produce up to `n` distinct variants of `baseline`. Variants identical
    /// to the baseline or to each other are dropped.
    pub fn mutate(&self, baseline: &Candidate, n: usize, ctx: &mut MutationContext<'_>) -> Variants {
        let mut out = Variants::default();
        if n == 0 {
            return out;
        }
        if self.requires_generator() && ctx.generator.is_none() {
            debug!(strategy = self.name(), "no generator configured; no variants");
            return out;
        }

        let mut seen = BTreeSet::new();
        seen.insert(normalise(&baseline.content));
        for attempt in 0..n * ATTEMPTS_PER_VARIANT {
            if out.candidates.len() >= n {
                break;
            }
            let text = match self {
                Strategy::TextGrad => textgrad(baseline, attempt, ctx, &mut out.tokens_used),
                Strategy::MetaRewrite => meta_rewrite(baseline, attempt, ctx, &mut out.tokens_used),
                Strategy::StructuralJitter => Some(structural_jitter(&baseline.content, ctx.rng)),
                Strategy::RandomJitter => Some(random_jitter(&baseline.content, ctx.feedback, ctx.rng)),
            };
            let Some(text) = text else {
                // Provider exhausted its retries; further attempts would fail the same way.
                break;
            };
            let text = text.trim().to_string();
            if text.is_empty() || !seen.insert(normalise(&text)) {
                continue;
            }
            out.candidates
                .push(Candidate::derive(baseline, ctx.generation, self.name(), text));
        }
        if out.candidates.len() < n {
            debug!(
                strategy = self.name(),
                requested = n,
                produced = out.candidates.len(),
                "fewer variants than requested"
            );
        }
        out
    }
}

fn normalise(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn generate(ctx: &MutationContext<'_>, what: &str, prompt: &str, tokens: &mut u64) -> Option<String> {
    let generator = ctx.generator?;
    match retry(&ctx.retry, what, || generator.generate(prompt, ctx.max_tokens, ctx.timeout)) {
        Ok(c) => {
            *tokens += c.tokens_used;
            Some(c.text)
        }
        Err(e) => {
            warn!(what, error = %e, "provider call exhausted retries; skipping");
            None
        }
    }
}

fn feedback_block(feedback: &[String]) -> String {
    if feedback.is_empty() {
        "(no missing concepts reported)".to_string()
    } else {
        feedback
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn textgrad(
    baseline: &Candidate,
    attempt: usize,
    ctx: &MutationContext<'_>,
    tokens: &mut u64,
) -> Option<String> {
    let critique_prompt = format!(
        "You are reviewing a prompt. The evaluator reported that its outputs miss these concepts:\n\
         {}\n\n## Prompt\n{}\n\n\
         Write a short critique (attempt {}): what should change so outputs cover the missing concepts?",
        feedback_block(ctx.feedback),
        baseline.content,
        attempt + 1,
    );
    let critique = generate(ctx, "textgrad critique", &critique_prompt, tokens)?;
    let rewrite_prompt = format!(
        "Rewrite the prompt below applying the critique. Output ONLY the rewritten prompt.\n\n\
         ## Critique\n{}\n\n## Prompt\n{}",
        critique.trim(),
        baseline.content,
    );
    generate(ctx, "textgrad rewrite", &rewrite_prompt, tokens)
}

fn meta_rewrite(
    baseline: &Candidate,
    attempt: usize,
    ctx: &MutationContext<'_>,
    tokens: &mut u64,
) -> Option<String> {
    let prompt = format!(
        "You are a prompt engineering expert. Improve this prompt to make it clearer, more specific, \
         and more likely to produce high-quality outputs. This is rewrite number {}; take a different \
         angle from earlier rewrites.\n\n## Original prompt\n{}\n\n\
         Improved prompt (output ONLY the improved prompt, no explanation):",
        attempt + 1,
        baseline.content,
    );
    generate(ctx, "meta rewrite", &prompt, tokens)
}

// ---------------------------------------------------------------------------
// Offline strategies
// ---------------------------------------------------------------------------

const CLARIFYING_PHRASES: &[&str] = &[
    "Be precise and thorough in your response.",
    "Support every claim with evidence.",
    "Use clear, professional language.",
    "Focus on actionable recommendations.",
];

const SYNONYMS: &[(&str, &str)] = &[
    ("analyze", "evaluate"),
    ("provide", "give"),
    ("explain", "describe"),
    ("careful", "thorough"),
    ("ensure", "make sure"),
    ("list", "enumerate"),
    ("brief", "concise"),
];

const FILLER_WORDS: &[&str] = &["please", "just", "really", "very", "simply", "basically"];

const EMPHASIS: &[&str] = &["carefully", "clearly", "explicitly"];

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\n') {
            let s = current.trim();
            if !s.is_empty() {
                out.push(s.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Reorder sentences, turn them into a numbered list, or append a clarifying
/// instruction.
pub fn structural_jitter(text: &str, rng: &mut StdRng) -> String {
    let mut parts = sentences(text);
    match rng.gen_range(0..3) {
        0 if parts.len() > 2 => {
            // Keep the opening sentence (usually the role) in place.
            parts[1..].shuffle(rng);
            parts.join(" ")
        }
        1 if parts.len() > 1 => parts
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => {
            let lower = text.to_lowercase();
            let unused: Vec<&&str> = CLARIFYING_PHRASES
                .iter()
                .filter(|p| !lower.contains(&p.to_lowercase()))
                .collect();
            match unused.choose(rng) {
                Some(phrase) => format!("{}\n\n{}", text.trim_end(), phrase),
                None => match parts.first().cloned() {
                    Some(first) if parts.len() > 1 => {
                        parts.remove(0);
                        parts.push(first);
                        parts.join(" ")
                    }
                    _ => text.to_string(),
                },
            }
        }
    }
}

/// Word-level perturbation. When feedback names missing concepts, one of
/// them is injected as an explicit instruction.
pub fn random_jitter(text: &str, feedback: &[String], rng: &mut StdRng) -> String {
    if !feedback.is_empty() && rng.gen_bool(0.5) {
        let lower = text.to_lowercase();
        let pending: Vec<&str> = feedback
            .iter()
            .filter_map(|c| c.split('|').map(str::trim).find(|a| !a.is_empty()))
            .filter(|c| !lower.contains(&format!("make sure to address {}.", c.to_lowercase())))
            .collect();
        if let Some(concept) = pending.choose(rng) {
            return format!("{} Make sure to address {}.", text.trim_end(), concept);
        }
    }

    let mut words: Vec<String> = text.split(' ').map(String::from).collect();
    match rng.gen_range(0..3) {
        0 => {
            let swaps: Vec<(usize, &str)> = words
                .iter()
                .enumerate()
                .filter_map(|(i, w)| {
                    let bare = w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
                    SYNONYMS.iter().find(|(from, _)| *from == bare).map(|(_, to)| (i, *to))
                })
                .collect();
            if let Some((i, to)) = swaps.choose(rng) {
                let bare = words[*i]
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_string();
                words[*i] = words[*i].replacen(&bare, to, 1);
            }
        }
        1 => {
            let fillers: Vec<usize> = words
                .iter()
                .enumerate()
                .filter(|(_, w)| FILLER_WORDS.contains(&w.to_lowercase().as_str()))
                .map(|(i, _)| i)
                .collect();
            if let Some(i) = fillers.choose(rng) {
                words.remove(*i);
            }
        }
        _ => {
            if !words.is_empty() {
                let at = rng.gen_range(0..=words.len());
                if let Some(word) = EMPHASIS.choose(rng) {
                    words.insert(at, word.to_string());
                }
            }
        }
    }
    words.join(" ")
}
