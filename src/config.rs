//! Project configuration for promptevo
//!
//! Configuration is stored in `.promptevo/config.toml` and controls the
//! evolution loop, the budget, and which providers back mutation, novelty,
//! and evaluation.
//!
//! API keys are stored separately in `~/.config/promptevo/credentials.toml`
//! (or read from the environment) to avoid accidentally committing secrets.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::bandit::{DEFAULT_EXPLORATION, RewardPolicy};
use crate::budget::{Budget, DEFAULT_WARN_FRACTION};
use crate::evaluator::{
    CachedEvaluator, DEFAULT_CACHE_ENTRIES, Evaluator, KeywordEvaluator, LlmJudgeEvaluator,
};
use crate::evolution::EvolutionSettings;
use crate::mutation::Strategy;
use crate::novelty::{Embedder, HashingEmbedder};
use crate::provider::{CommandGenerator, RetryPolicy, TextGenerator};
use crate::rubric::Rubric;
use crate::stop_rules::StopRules;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub evolution: EvolutionConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    /// Text generation backend for mutation and simulation
    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub novelty: NoveltyConfig,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvolutionConfig {
    /// Variants requested from a strategy per generation
    #[serde(default = "default_variants")]
    pub variants: usize,

    /// UCB1 exploration constant
    #[serde(default = "default_exploration")]
    pub exploration: f64,

    /// Seed for stochastic strategies; a fresh seed is drawn when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,

    /// Threads used to evaluate one generation's variants
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Stop after this many generations without a new champion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patience: Option<u32>,

    /// Stop once the champion reaches this composite score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_score: Option<f64>,

    /// Stop when composite rises while robustness falls
    #[serde(default = "default_true")]
    pub safety_plateau: bool,

    /// Strategies offered to the bandit (default: all)
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,
}

fn default_variants() -> usize {
    3
}

fn default_exploration() -> f64 {
    DEFAULT_EXPLORATION
}

fn default_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_strategies() -> Vec<String> {
    Strategy::ALL.iter().map(|s| s.name().to_string()).collect()
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            variants: default_variants(),
            exploration: default_exploration(),
            rng_seed: None,
            workers: default_workers(),
            patience: None,
            target_score: None,
            safety_plateau: true,
            strategies: default_strategies(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,

    #[serde(default = "default_max_seconds")]
    pub max_seconds: f64,

    #[serde(default = "default_max_generations")]
    pub max_generations: Option<u32>,

    /// Remaining fraction below which telemetry flags the budget as low
    #[serde(default = "default_warn_fraction")]
    pub warn_fraction: f64,
}

fn default_max_tokens() -> u64 {
    50_000
}

fn default_max_seconds() -> f64 {
    600.0
}

fn default_max_generations() -> Option<u32> {
    Some(10)
}

fn default_warn_fraction() -> f64 {
    DEFAULT_WARN_FRACTION
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_seconds: default_max_seconds(),
            max_generations: default_max_generations(),
            warn_fraction: default_warn_fraction(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// No model; only offline strategies produce variants
    #[default]
    None,
    /// Local CLI, prompt on stdin
    Command,
    /// OpenAI-compatible HTTP endpoint
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,

    /// Command template for `kind = "command"` ({model}, {max_tokens})
    #[serde(default = "default_command")]
    pub command: String,

    /// Base URL for `kind = "http"`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_provider_model")]
    pub model: String,

    /// Environment variable checked for the API key before the credentials file
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_provider_max_tokens")]
    pub max_tokens: u32,

    /// Attempts per call, including the first
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_command() -> String {
    "ollama run {model}".to_string()
}

fn default_endpoint() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_provider_model() -> String {
    "llama3.1".to_string()
}

fn default_api_key_env() -> String {
    "PROMPTEVO_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_provider_max_tokens() -> u32 {
    512
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_temperature() -> f64 {
    0.7
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::None,
            command: default_command(),
            endpoint: default_endpoint(),
            model: default_provider_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_provider_max_tokens(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            temperature: default_temperature(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retries.max(1),
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    /// Offline feature hashing
    #[default]
    Hashing,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub kind: EmbeddingKind,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Defaults to the provider endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_embedding_model")]
    pub model: String,
}

fn default_dimensions() -> usize {
    256
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            kind: EmbeddingKind::Hashing,
            dimensions: default_dimensions(),
            endpoint: None,
            model: default_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoveltyConfig {
    /// Novelty below this halves (by `penalty`) the bandit reward
    #[serde(default = "default_novelty_threshold")]
    pub threshold: f64,

    #[serde(default = "default_novelty_penalty")]
    pub penalty: f64,
}

fn default_novelty_threshold() -> f64 {
    0.2
}

fn default_novelty_penalty() -> f64 {
    0.5
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            threshold: default_novelty_threshold(),
            penalty: default_novelty_penalty(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvaluatorKind {
    /// Deterministic concept matching
    #[default]
    Keyword,
    /// Model-graded; requires a provider
    Judge,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EvaluatorConfig {
    #[serde(default)]
    pub kind: EvaluatorKind,

    /// Score provider outputs per scenario instead of the candidate text
    #[serde(default)]
    pub simulate: bool,

    /// Overrides for the rubric file's values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_threshold: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ceiling: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ceiling_ms: Option<u64>,

    /// Most reports memoised per run (default 1000, 0 disables)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_entries: Option<usize>,
}

impl EvaluatorConfig {
    /// Apply configured overrides to a rubric loaded from file.
    pub fn apply(&self, rubric: &mut Rubric) {
        if let Some(t) = self.pass_threshold {
            rubric.pass_threshold = t;
        }
        if let Some(t) = self.token_ceiling {
            rubric.token_ceiling = t;
        }
        if let Some(t) = self.latency_ceiling_ms {
            rubric.latency_ceiling_ms = t;
        }
    }
}

/// API keys, kept outside the project directory.
/// Stored in ~/.config/promptevo/credentials.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: Option<String>,

    /// Falls back to `api_key` when unset
    #[serde(default)]
    pub embedding_api_key: Option<String>,
}

impl Credentials {
    /// Get the path to the global credentials file
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("promptevo").join("credentials.toml"))
    }

    /// Load credentials from ~/.config/promptevo/credentials.toml
    /// Returns empty credentials if the file doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read credentials: {}", e))?;
        let creds: Credentials = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse credentials: {}", e))?;
        Ok(creds)
    }

    /// The environment variable wins over the file.
    pub fn resolve_api_key(&self, env_var: &str) -> Option<String> {
        std::env::var(env_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.api_key.clone())
    }
}

impl Config {
    /// Load configuration from .promptevo/config.toml
    /// Returns default config if file doesn't exist
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let config_path = dir.join("config.toml");

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config: {}", e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Save configuration to .promptevo/config.toml
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let config_path = dir.join("config.toml");

        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;

        fs::write(&config_path, content)
            .map_err(|e| anyhow::anyhow!("Failed to write config: {}", e))?;

        Ok(())
    }

    /// Initialize default config file if it doesn't exist
    pub fn init(dir: &Path) -> anyhow::Result<bool> {
        let config_path = dir.join("config.toml");

        if config_path.exists() {
            return Ok(false);
        }

        fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", dir.display(), e))?;
        Self::default().save(dir)?;
        Ok(true)
    }

    /// Strategies named in `[evolution].strategies`, de-duplicated.
    pub fn strategies(&self) -> anyhow::Result<Vec<Strategy>> {
        let mut out = Vec::new();
        for name in &self.evolution.strategies {
            let s: Strategy = name.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            if !out.contains(&s) {
                out.push(s);
            }
        }
        Ok(out)
    }

    pub fn budget(&self) -> Budget {
        Budget::new(self.budget.max_tokens, self.budget.max_seconds)
            .with_warn_fraction(self.budget.warn_fraction)
    }

    /// Loop settings derived from the configuration.
    pub fn evolution_settings(&self) -> anyhow::Result<EvolutionSettings> {
        let rng_seed = match self.evolution.rng_seed {
            Some(seed) => seed,
            None => {
                let seed = rand::random();
                info!(rng_seed = seed, "no rng_seed configured, picked one");
                seed
            }
        };
        Ok(EvolutionSettings {
            strategies: self.strategies()?,
            variants: self.evolution.variants,
            exploration: self.evolution.exploration,
            rng_seed,
            workers: self.evolution.workers.max(1),
            reward: RewardPolicy {
                novelty_threshold: self.novelty.threshold,
                novelty_penalty: self.novelty.penalty,
                ..RewardPolicy::default()
            },
            stop: StopRules {
                max_generations: self.budget.max_generations,
                target_score: self.evolution.target_score,
                patience: self.evolution.patience,
                safety_plateau: self.evolution.safety_plateau,
            },
            retry: self.provider.retry_policy(),
            provider_timeout: self.provider.timeout(),
            max_tokens: self.provider.max_tokens,
        })
    }

    /// Build the configured text generator, if any.
    pub fn text_generator(&self, creds: &Credentials) -> anyhow::Result<Option<Arc<dyn TextGenerator>>> {
        let p = &self.provider;
        match p.kind {
            ProviderKind::None => Ok(None),
            ProviderKind::Command => Ok(Some(Arc::new(CommandGenerator::new(
                p.command.clone(),
                p.model.clone(),
            )))),
            #[cfg(feature = "http")]
            ProviderKind::Http => Ok(Some(Arc::new(
                crate::provider::HttpGenerator::new(p.endpoint.clone(), p.model.clone())
                    .with_api_key(creds.resolve_api_key(&p.api_key_env))
                    .with_temperature(p.temperature),
            ))),
            #[cfg(not(feature = "http"))]
            ProviderKind::Http => {
                let _ = creds;
                anyhow::bail!("provider kind 'http' requires the 'http' feature")
            }
        }
    }

    /// Build the configured evaluator, wrapped in a result cache.
    pub fn evaluator(&self, generator: Option<Arc<dyn TextGenerator>>) -> anyhow::Result<Box<dyn Evaluator>> {
        let p = &self.provider;
        let cap = self.evaluator.cache_entries.unwrap_or(DEFAULT_CACHE_ENTRIES);
        let needs_generator = |what: &str| {
            anyhow::anyhow!("{} requires a provider; set [provider].kind in config.toml", what)
        };
        match self.evaluator.kind {
            EvaluatorKind::Keyword => {
                let mut eval = KeywordEvaluator::new();
                if self.evaluator.simulate {
                    let g = generator.ok_or_else(|| needs_generator("evaluator.simulate"))?;
                    eval = eval.with_simulation(g, p.max_tokens, p.timeout(), p.retry_policy());
                }
                Ok(Box::new(CachedEvaluator::new(eval).with_max_entries(cap)))
            }
            EvaluatorKind::Judge => {
                let g = generator.ok_or_else(|| needs_generator("evaluator kind 'judge'"))?;
                let judge = LlmJudgeEvaluator::new(g, p.timeout(), p.retry_policy());
                Ok(Box::new(CachedEvaluator::new(judge).with_max_entries(cap)))
            }
        }
    }

    /// Build the configured embedder.
    pub fn embedder(&self, creds: &Credentials) -> anyhow::Result<Arc<dyn Embedder>> {
        let e = &self.embedding;
        match e.kind {
            EmbeddingKind::Hashing => Ok(Arc::new(HashingEmbedder::new(e.dimensions))),
            #[cfg(feature = "http")]
            EmbeddingKind::Http => {
                let endpoint = e.endpoint.clone().unwrap_or_else(|| self.provider.endpoint.clone());
                let key = creds
                    .embedding_api_key
                    .clone()
                    .or_else(|| creds.resolve_api_key(&self.provider.api_key_env));
                Ok(Arc::new(
                    crate::novelty::HttpEmbedder::new(endpoint, e.model.clone(), e.dimensions)
                        .with_api_key(key)
                        .with_timeout(self.provider.timeout()),
                ))
            }
            #[cfg(not(feature = "http"))]
            EmbeddingKind::Http => {
                let _ = creds;
                anyhow::bail!("embedding kind 'http' requires the 'http' feature")
            }
        }
    }
}
