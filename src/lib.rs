pub mod bandit;
pub mod budget;
pub mod candidate;
pub mod config;
pub mod diff;
pub mod evaluator;
pub mod evolution;
pub mod heuristics;
pub mod mutation;
pub mod novelty;
pub mod proposal;
pub mod provider;
pub mod rubric;
pub mod run_store;
pub mod stop_rules;
pub mod telemetry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_helpers;

pub use bandit::{Arm, Bandit, BanditError, BanditSnapshot, DEFAULT_EXPLORATION, RewardPolicy};
pub use budget::{Budget, BudgetFlags, BudgetLimit};
pub use candidate::{Candidate, CandidateArchive};
pub use config::{Config, Credentials};
pub use evaluator::{
    CachedEvaluator, EvaluationError, Evaluator, KeywordEvaluator, LlmJudgeEvaluator, ScoreReport,
};
pub use evolution::{
    Champion, EvolutionError, EvolutionRun, EvolutionSettings, Generation, RunReport, RunStatus,
};
pub use mutation::{MutationContext, Strategy, Variants};
pub use novelty::{Embedder, HashingEmbedder, NoveltyDetector, cosine_similarity};
pub use proposal::{
    DiffProposal, JsonlProposalStore, MemoryProposalStore, ProposalError, ProposalGate,
    ProposalStatus, ProposalStore,
};
pub use provider::{Completion, ProviderError, RetryPolicy, TextGenerator};
pub use rubric::{Rubric, RubricFile, TestInput};
pub use stop_rules::{StopReason, StopRules};
pub use telemetry::{JsonlTelemetry, TelemetryRecord, TelemetrySink};
