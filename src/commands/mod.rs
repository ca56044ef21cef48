pub mod init;
pub mod proposals;
pub mod run_evolution;
pub mod runs;

use std::path::Path;

use anyhow::Result;
use promptevo::proposal::{JsonlProposalStore, ProposalGate};

/// Open the proposal gate over `<dir>/proposals.jsonl`.
pub fn open_gate(dir: &Path) -> Result<ProposalGate> {
    if !dir.exists() {
        anyhow::bail!("promptevo not initialized. Run 'pevo init' first.");
    }
    Ok(ProposalGate::new(JsonlProposalStore::in_dir(dir)))
}
