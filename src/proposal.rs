//! Human-in-the-loop proposal gate.
//!
//! Every new champion found by a run becomes a [`DiffProposal`] in status
//! `pending`. Nothing in this crate applies a proposal; approval is a record
//! that an external, manual change is sanctioned.
//!
//! Legal transitions:
//!
//! | from       | to                                     |
//! |------------|----------------------------------------|
//! | `pending`  | `approved`, `rejected`, `deferred`     |
//! | `deferred` | `pending`, `approved`, `rejected`, `deferred` |
//! | `approved` | (terminal)                             |
//! | `rejected` | (terminal)                             |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{info, warn};

use crate::candidate::{Candidate, short_id};
use crate::diff::unified_diff;

#[derive(Error, Debug)]
pub enum ProposalError {
    #[error("invalid transition for proposal '{id}': {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ProposalStatus,
        to: ProposalStatus,
    },
    #[error("proposal '{0}' not found")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error on line {line}: {source}")]
    Json {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Lock error: {0}")]
    Lock(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Deferred,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Approved | ProposalStatus::Rejected)
    }

    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        match self {
            ProposalStatus::Pending => next != ProposalStatus::Pending,
            ProposalStatus::Deferred => true,
            ProposalStatus::Approved | ProposalStatus::Rejected => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Deferred => "deferred",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ProposalStatus::Pending),
            "approved" | "approve" => Ok(ProposalStatus::Approved),
            "rejected" | "reject" => Ok(ProposalStatus::Rejected),
            "deferred" | "defer" => Ok(ProposalStatus::Deferred),
            other => Err(format!(
                "unknown status '{}' (expected pending, approved, rejected, deferred)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffProposal {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub candidate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_champion_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub generation: u32,
    /// Composite delta of the candidate over the prior champion.
    pub predicted_delta: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub rationale: String,
    /// Unified diff from the prior champion's content.
    #[serde(default)]
    pub diff: String,
    pub status: ProposalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_rationale: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl DiffProposal {
    /// Apply a decision, enforcing the transition table. The proposal is left
    /// untouched on error.
    pub fn apply(
        &mut self,
        to: ProposalStatus,
        rationale: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), ProposalError> {
        if !self.status.can_transition_to(to) {
            return Err(ProposalError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.decision_rationale = rationale;
        self.decided_at = Some(at);
        Ok(())
    }
}

/// Everything the loop knows when it proposes a new champion.
#[derive(Debug, Clone)]
pub struct ProposalDraft<'a> {
    pub run_id: Option<&'a str>,
    pub candidate: &'a Candidate,
    pub prior_champion: Option<&'a Candidate>,
    pub predicted_delta: f64,
    pub score: Option<f64>,
    pub rationale: String,
}

static PROPOSAL_SEQ: AtomicU64 = AtomicU64::new(0);

fn proposal_id(run_id: Option<&str>, candidate_id: &str, created_at: &DateTime<Utc>) -> String {
    let seq = PROPOSAL_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(seq.to_le_bytes());
    hasher.update(run_id.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(candidate_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(created_at.to_rfc3339().as_bytes());
    format!("prop-{}", &format!("{:x}", hasher.finalize())[..12])
}

impl ProposalDraft<'_> {
    fn into_proposal(self) -> DiffProposal {
        let created_at = Utc::now();
        let diff = match self.prior_champion {
            Some(prior) => unified_diff(
                &prior.content,
                &self.candidate.content,
                &format!("champion/{}", short_id(&prior.id)),
                &format!("candidate/{}", short_id(&self.candidate.id)),
                3,
            ),
            None => String::new(),
        };
        DiffProposal {
            id: proposal_id(self.run_id, &self.candidate.id, &created_at),
            run_id: self.run_id.map(String::from),
            candidate_id: self.candidate.id.clone(),
            prior_champion_id: self.prior_champion.map(|c| c.id.clone()),
            strategy: self.candidate.strategy.clone(),
            generation: self.candidate.generation,
            predicted_delta: self.predicted_delta,
            score: self.score,
            rationale: self.rationale,
            diff,
            status: ProposalStatus::Pending,
            decision_rationale: None,
            created_at,
            decided_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Durable backing for the gate. Implementations must make `decide`
/// atomic: read current status, check the transition, persist.
pub trait ProposalStore: Send {
    fn insert(&mut self, proposal: DiffProposal) -> Result<(), ProposalError>;

    fn decide(
        &mut self,
        id: &str,
        to: ProposalStatus,
        rationale: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<DiffProposal, ProposalError>;

    /// All proposals in creation order.
    fn all(&mut self) -> Result<Vec<DiffProposal>, ProposalError>;
}

#[derive(Debug, Default)]
pub struct MemoryProposalStore {
    proposals: Vec<DiffProposal>,
}

impl MemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProposalStore for MemoryProposalStore {
    fn insert(&mut self, proposal: DiffProposal) -> Result<(), ProposalError> {
        self.proposals.push(proposal);
        Ok(())
    }

    fn decide(
        &mut self,
        id: &str,
        to: ProposalStatus,
        rationale: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<DiffProposal, ProposalError> {
        let p = self
            .proposals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))?;
        p.apply(to, rationale, at)?;
        Ok(p.clone())
    }

    fn all(&mut self) -> Result<Vec<DiffProposal>, ProposalError> {
        Ok(self.proposals.clone())
    }
}

/// One line of the proposal event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ProposalEvent {
    Proposed {
        proposal: DiffProposal,
    },
    Decided {
        id: String,
        status: ProposalStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
        at: DateTime<Utc>,
    },
}

/// RAII guard for the store's advisory lock.
struct FileLock {
    #[cfg(unix)]
    file: File,
}

impl FileLock {
    #[cfg(unix)]
    fn acquire(lock_path: &Path) -> Result<Self, ProposalError> {
        use std::os::unix::io::AsRawFd;

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(ProposalError::Lock(format!(
                "Failed to acquire lock on {:?}: {}",
                lock_path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(FileLock { file })
    }

    #[cfg(not(unix))]
    fn acquire(_lock_path: &Path) -> Result<Self, ProposalError> {
        Ok(FileLock {})
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Append-only JSONL event log (`proposed` and `decided` events).
///
/// Every operation takes the lock and replays the log, so several processes
/// (a running loop and a reviewer) can share one file.
#[derive(Debug, Clone)]
pub struct JsonlProposalStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonlProposalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    /// `<dir>/proposals.jsonl`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("proposals.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(&self) -> Result<Vec<DiffProposal>, ProposalError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut proposals: Vec<DiffProposal> = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event: ProposalEvent = serde_json::from_str(trimmed).map_err(|e| ProposalError::Json {
                line: line_num + 1,
                source: e,
            })?;
            match event {
                ProposalEvent::Proposed { proposal } => {
                    if proposals.iter().any(|p| p.id == proposal.id) {
                        warn!(id = %proposal.id, line = line_num + 1, "duplicate proposal event ignored");
                        continue;
                    }
                    proposals.push(proposal);
                }
                ProposalEvent::Decided {
                    id,
                    status,
                    rationale,
                    at,
                } => match proposals.iter_mut().find(|p| p.id == id) {
                    Some(p) => {
                        if let Err(e) = p.apply(status, rationale, at) {
                            warn!(line = line_num + 1, error = %e, "illegal decision in log ignored");
                        }
                    }
                    None => warn!(%id, line = line_num + 1, "decision for unknown proposal ignored"),
                },
            }
        }
        Ok(proposals)
    }

    fn append(&self, event: &ProposalEvent) -> Result<(), ProposalError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(event).map_err(|e| ProposalError::Json { line: 0, source: e })?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", json)?;
        file.flush()?;
        Ok(())
    }
}

impl ProposalStore for JsonlProposalStore {
    fn insert(&mut self, proposal: DiffProposal) -> Result<(), ProposalError> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        self.append(&ProposalEvent::Proposed { proposal })
    }

    fn decide(
        &mut self,
        id: &str,
        to: ProposalStatus,
        rationale: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<DiffProposal, ProposalError> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut proposals = self.replay()?;
        let p = proposals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))?;
        p.apply(to, rationale.clone(), at)?;
        self.append(&ProposalEvent::Decided {
            id: id.to_string(),
            status: to,
            rationale,
            at,
        })?;
        Ok(p.clone())
    }

    fn all(&mut self) -> Result<Vec<DiffProposal>, ProposalError> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        self.replay()
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Counts by status plus acceptance rate over decided proposals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposalStats {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub deferred: usize,
    /// `approved / (approved + rejected)`, if anything was decided.
    pub acceptance_rate: Option<f64>,
}

/// A human decision usable as a training label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledOutcome {
    pub proposal_id: String,
    pub candidate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub predicted_delta: f64,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// The only sanctioned path from "a run found something better" to "an
/// artifact may change". Safe to share between threads; decisions are
/// serialized.
pub struct ProposalGate {
    store: Mutex<Box<dyn ProposalStore>>,
}

impl fmt::Debug for ProposalGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProposalGate").finish_non_exhaustive()
    }
}

impl ProposalGate {
    pub fn new(store: impl ProposalStore + 'static) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryProposalStore::new())
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&mut dyn ProposalStore) -> Result<T, ProposalError>,
    ) -> Result<T, ProposalError> {
        let mut guard = self
            .store
            .lock()
            .map_err(|_| ProposalError::Lock("proposal store mutex poisoned".to_string()))?;
        f(guard.as_mut())
    }

    /// Record a pending proposal for `candidate`.
    pub fn propose(
        &self,
        candidate: &Candidate,
        predicted_delta: f64,
        rationale: impl Into<String>,
    ) -> Result<String, ProposalError> {
        self.propose_draft(ProposalDraft {
            run_id: None,
            candidate,
            prior_champion: None,
            predicted_delta,
            score: None,
            rationale: rationale.into(),
        })
    }

    pub fn propose_draft(&self, draft: ProposalDraft<'_>) -> Result<String, ProposalError> {
        let proposal = draft.into_proposal();
        let id = proposal.id.clone();
        info!(%id, candidate = short_id(&proposal.candidate_id), delta = proposal.predicted_delta, "proposal created");
        self.with_store(|s| s.insert(proposal))?;
        Ok(id)
    }

    pub fn decide(
        &self,
        id: &str,
        decision: ProposalStatus,
        rationale: Option<String>,
    ) -> Result<DiffProposal, ProposalError> {
        let p = self.with_store(|s| s.decide(id, decision, rationale, Utc::now()))?;
        info!(%id, status = %p.status, "proposal decided");
        Ok(p)
    }

    pub fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<DiffProposal>, ProposalError> {
        let all = self.with_store(|s| s.all())?;
        Ok(match status {
            Some(st) => all.into_iter().filter(|p| p.status == st).collect(),
            None => all,
        })
    }

    /// Look up by full id or unique prefix.
    /// Look up a proposal by id or unique id prefix.
    pub fn get(&self, id: &str) -> Result<DiffProposal, ProposalError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ProposalError::NotFound(id.to_string()));
        }
        let all = self.list(None)?;
        if let Some(p) = all.iter().find(|p| p.id == id) {
            return Ok(p.clone());
        }
        let mut matches = all.into_iter().filter(|p| p.id.starts_with(id));
        match (matches.next(), matches.next()) {
            (Some(p), None) => Ok(p),
            _ => Err(ProposalError::NotFound(id.to_string())),
        }
    }

    pub fn stats(&self) -> Result<ProposalStats, ProposalError> {
        let all = self.list(None)?;
        let count = |s: ProposalStatus| all.iter().filter(|p| p.status == s).count();
        let approved = count(ProposalStatus::Approved);
        let rejected = count(ProposalStatus::Rejected);
        Ok(ProposalStats {
            total: all.len(),
            pending: count(ProposalStatus::Pending),
            approved,
            rejected,
            deferred: count(ProposalStatus::Deferred),
            acceptance_rate: if approved + rejected > 0 {
                Some(approved as f64 / (approved + rejected) as f64)
            } else {
                None
            },
        })
    }

    pub fn labeled_outcomes(&self) -> Result<Vec<LabeledOutcome>, ProposalError> {
        Ok(self
            .list(None)?
            .into_iter()
            .filter(|p| p.status.is_terminal())
            .map(|p| LabeledOutcome {
                approved: p.status == ProposalStatus::Approved,
                proposal_id: p.id,
                candidate_id: p.candidate_id,
                strategy: p.strategy,
                predicted_delta: p.predicted_delta,
                rationale: p.decision_rationale,
            })
            .collect())
    }
}

/// Render proposals as a reviewable markdown document.
pub fn render_markdown(proposals: &[DiffProposal]) -> String {
    let mut out = String::from("# Proposed changes\n\n");
    if proposals.is_empty() {
        out.push_str("_No proposals._\n");
        return out;
    }
    for p in proposals {
        out.push_str(&format!("## {} [{}]\n\n", p.id, p.status.as_str().to_uppercase()));
        out.push_str(&format!("- Candidate: `{}`\n", p.candidate_id));
        if let Some(ref prior) = p.prior_champion_id {
            out.push_str(&format!("- Replaces: `{}`\n", prior));
        }
        if let Some(ref strategy) = p.strategy {
            out.push_str(&format!("- Strategy: {}\n", strategy));
        }
        out.push_str(&format!("- Generation: {}\n", p.generation));
        if let Some(score) = p.score {
            out.push_str(&format!("- Score: {:.1}\n", score));
        }
        out.push_str(&format!("- Predicted Δscore: {:+.1}\n", p.predicted_delta));
        out.push_str(&format!("- Created: {}\n\n", p.created_at.to_rfc3339()));
        out.push_str(&format!("**Rationale:** {}\n\n", p.rationale));
        if !p.diff.is_empty() {
            out.push_str("```diff\n");
            out.push_str(&p.diff);
            if !p.diff.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("```\n\n");
        }
        if let Some(at) = p.decided_at {
            out.push_str(&format!(
                "**Decision:** {} at {}",
                p.status,
                at.to_rfc3339()
            ));
            if let Some(ref why) = p.decision_rationale {
                out.push_str(&format!(": {}", why));
            }
            out.push_str("\n\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn seed_and_child() -> (Candidate, Candidate) {
        let seed = Candidate::seed("Summarise the ticket.");
        let child = Candidate::derive(&seed, 1, "textgrad", "Summarise the ticket.\nList next steps.");
        (seed, child)
    }

    #[test]
    fn transition_table() {
        use ProposalStatus::*;
        for to in [Approved, Rejected, Deferred] {
            assert!(Pending.can_transition_to(to));
        }
        assert!(!Pending.can_transition_to(Pending));
        for to in [Pending, Approved, Rejected, Deferred] {
            assert!(Deferred.can_transition_to(to));
            assert!(!Approved.can_transition_to(to));
            assert!(!Rejected.can_transition_to(to));
        }
    }

    #[test]
    fn propose_starts_pending() {
        let gate = ProposalGate::in_memory();
        let (_, child) = seed_and_child();
        let id = gate.propose(&child, 12.5, "better coverage").unwrap();
        let p = gate.get(&id).unwrap();
        assert_eq!(p.status, ProposalStatus::Pending);
        assert_eq!(p.strategy.as_deref(), Some("textgrad"));
        assert!(p.decided_at.is_none());
    }

    #[test]
    fn draft_carries_diff_against_prior_champion() {
        let gate = ProposalGate::in_memory();
        let (seed, child) = seed_and_child();
        let id = gate
            .propose_draft(ProposalDraft {
                run_id: Some("run-1"),
                candidate: &child,
                prior_champion: Some(&seed),
                predicted_delta: 15.0,
                score: Some(75.0),
                rationale: "adds next steps".to_string(),
            })
            .unwrap();
        let p = gate.get(&id).unwrap();
        assert!(p.diff.contains("+List next steps."));
        assert_eq!(p.prior_champion_id.as_deref(), Some(seed.id.as_str()));
        assert_eq!(p.run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn approve_then_reject_is_invalid() {
        let gate = ProposalGate::in_memory();
        let (_, child) = seed_and_child();
        let id = gate.propose(&child, 1.0, "r").unwrap();
        gate.decide(&id, ProposalStatus::Approved, None).unwrap();
        let err = gate.decide(&id, ProposalStatus::Rejected, Some("changed mind".into())).unwrap_err();
        assert!(matches!(err, ProposalError::InvalidTransition { .. }));
        assert_eq!(gate.get(&id).unwrap().status, ProposalStatus::Approved);
    }

    #[test]
    fn deferred_can_be_reopened() {
        let gate = ProposalGate::in_memory();
        let (_, child) = seed_and_child();
        let id = gate.propose(&child, 1.0, "r").unwrap();
        gate.decide(&id, ProposalStatus::Deferred, None).unwrap();
        gate.decide(&id, ProposalStatus::Pending, None).unwrap();
        gate.decide(&id, ProposalStatus::Rejected, Some("no".into())).unwrap();
        assert_eq!(gate.get(&id).unwrap().status, ProposalStatus::Rejected);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let gate = ProposalGate::in_memory();
        assert!(matches!(
            gate.decide("prop-missing", ProposalStatus::Approved, None),
            Err(ProposalError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_decisions_on_one_id_have_a_single_winner() {
        let gate = Arc::new(ProposalGate::in_memory());
        let (_, child) = seed_and_child();
        let id = gate.propose(&child, 1.0, "r").unwrap();
        let results: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let gate = gate.clone();
                    let id = id.clone();
                    s.spawn(move || {
                        let to = if i % 2 == 0 {
                            ProposalStatus::Approved
                        } else {
                            ProposalStatus::Rejected
                        };
                        gate.decide(&id, to, None).is_ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    }

    #[test]
    fn jsonl_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let (seed, child) = seed_and_child();
        let id = {
            let gate = ProposalGate::new(JsonlProposalStore::in_dir(dir.path()));
            let id = gate.propose(&child, 3.0, "r").unwrap();
            gate.propose(&seed, 0.5, "other").unwrap();
            gate.decide(&id, ProposalStatus::Approved, Some("ship it".into())).unwrap();
            id
        };
        let gate = ProposalGate::new(JsonlProposalStore::in_dir(dir.path()));
        let p = gate.get(&id).unwrap();
        assert_eq!(p.status, ProposalStatus::Approved);
        assert_eq!(p.decision_rationale.as_deref(), Some("ship it"));
        assert_eq!(gate.list(Some(ProposalStatus::Pending)).unwrap().len(), 1);
        let lines = fs::read_to_string(dir.path().join("proposals.jsonl")).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }

    #[test]
    fn jsonl_store_sees_decisions_from_other_writers() {
        let dir = TempDir::new().unwrap();
        let (_, child) = seed_and_child();
        let loop_gate = ProposalGate::new(JsonlProposalStore::in_dir(dir.path()));
        let reviewer = ProposalGate::new(JsonlProposalStore::in_dir(dir.path()));
        let id = loop_gate.propose(&child, 3.0, "r").unwrap();
        reviewer.decide(&id, ProposalStatus::Rejected, None).unwrap();
        assert!(matches!(
            loop_gate.decide(&id, ProposalStatus::Approved, None),
            Err(ProposalError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let gate = ProposalGate::new(JsonlProposalStore::in_dir(dir.path()));
        assert!(gate.list(None).unwrap().is_empty());
    }

    #[test]
    fn corrupt_log_reports_line() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("proposals.jsonl"), "\n{not json\n").unwrap();
        let gate = ProposalGate::new(JsonlProposalStore::in_dir(dir.path()));
        match gate.list(None) {
            Err(ProposalError::Json { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected JSON error, got {:?}", other),
        }
    }

    #[test]
    fn stats_and_labels() {
        let gate = ProposalGate::in_memory();
        let (seed, child) = seed_and_child();
        let a = gate.propose(&child, 5.0, "a").unwrap();
        let b = gate.propose(&seed, 2.0, "b").unwrap();
        gate.propose(&child, 1.0, "c").unwrap();
        gate.decide(&a, ProposalStatus::Approved, Some("good".into())).unwrap();
        gate.decide(&b, ProposalStatus::Rejected, Some("regresses tone".into())).unwrap();

        let stats = gate.stats().unwrap();
        assert_eq!((stats.total, stats.pending, stats.approved, stats.rejected), (3, 1, 1, 1));
        assert_eq!(stats.acceptance_rate, Some(0.5));

        let labels = gate.labeled_outcomes().unwrap();
        assert_eq!(labels.len(), 2);
        assert!(labels.iter().any(|l| l.proposal_id == a && l.approved));
        assert!(labels.iter().any(|l| l.proposal_id == b && !l.approved));
    }

    #[test]
    fn markdown_rendering() {
        let gate = ProposalGate::in_memory();
        let (seed, child) = seed_and_child();
        let id = gate
            .propose_draft(ProposalDraft {
                run_id: None,
                candidate: &child,
                prior_champion: Some(&seed),
                predicted_delta: 15.0,
                score: Some(75.0),
                rationale: "adds next steps".to_string(),
            })
            .unwrap();
        gate.decide(&id, ProposalStatus::Deferred, Some("later".into())).unwrap();
        let md = render_markdown(&gate.list(None).unwrap());
        assert!(md.contains(&format!("## {} [DEFERRED]", id)));
        assert!(md.contains("Predicted Δscore: +15.0"));
        assert!(md.contains("```diff\n"));
        assert!(md.contains("**Decision:** deferred"));
        assert!(md.contains(": later"));
        assert!(render_markdown(&[]).contains("_No proposals._"));
    }

    #[test]
    fn get_accepts_unique_prefix() {
        let gate = ProposalGate::in_memory();
        let (_, child) = seed_and_child();
        let id = gate.propose(&child, 1.0, "r").unwrap();
        assert_eq!(gate.get(&id[..9]).unwrap().id, id);
    }

    #[test]
    fn get_rejects_empty_id_with_single_proposal() {
        let gate = ProposalGate::in_memory();
        let (_, child) = seed_and_child();
        gate.propose(&child, 1.0, "r").unwrap();
        assert!(matches!(gate.get(""), Err(ProposalError::NotFound(_))));
        assert!(matches!(gate.get("  "), Err(ProposalError::NotFound(_))));
    }
}
