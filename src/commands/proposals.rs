//! `pevo proposals`: the human side of the approval gate.

use anyhow::{Context, Result};
use dialoguer::{Input, Select};
use std::fs;
use std::path::Path;

use promptevo::candidate::short_id;
use promptevo::proposal::{DiffProposal, ProposalStatus, render_markdown};

use super::open_gate;

fn parse_status(s: Option<&str>) -> Result<Option<ProposalStatus>> {
    s.map(|s| s.parse::<ProposalStatus>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()
}

fn print_row(p: &DiffProposal) {
    let marker = match p.status {
        ProposalStatus::Pending => "[ ]",
        ProposalStatus::Approved => "[✓]",
        ProposalStatus::Rejected => "[✗]",
        ProposalStatus::Deferred => "[~]",
    };
    println!(
        "{} {}  {:+6.1}  gen {:<3} {:<18} {}",
        marker,
        p.id,
        p.predicted_delta,
        p.generation,
        p.strategy.as_deref().unwrap_or("-"),
        short_id(&p.candidate_id)
    );
}

pub fn list(dir: &Path, status: Option<&str>, json: bool) -> Result<()> {
    let gate = open_gate(dir)?;
    let proposals = gate.list(parse_status(status)?)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&proposals)?);
    } else if proposals.is_empty() {
        println!("No proposals found");
    } else {
        for p in &proposals {
            print_row(p);
        }
    }
    Ok(())
}

pub fn show(dir: &Path, id: &str, json: bool) -> Result<()> {
    let p = open_gate(dir)?.get(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&p)?);
    } else {
        print!("{}", render_markdown(std::slice::from_ref(&p)));
    }
    Ok(())
}

pub fn decide(dir: &Path, id: &str, decision: &str, rationale: Option<String>, json: bool) -> Result<()> {
    let status: ProposalStatus = decision.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let gate = open_gate(dir)?;
    let full_id = gate.get(id)?.id;
    let p = gate.decide(&full_id, status, rationale)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&p)?);
    } else {
        println!("Proposal {} is now {}", p.id, p.status);
    }
    Ok(())
}

/// Step through pending (and deferred) proposals, prompting for a decision.
pub fn review(dir: &Path) -> Result<()> {
    let gate = open_gate(dir)?;
    let queue: Vec<DiffProposal> = gate
        .list(None)?
        .into_iter()
        .filter(|p| !p.status.is_terminal())
        .collect();
    if queue.is_empty() {
        println!("Nothing to review.");
        return Ok(());
    }

    let options = &["approve", "reject", "defer", "skip", "quit"];
    for p in queue {
        println!();
        print!("{}", render_markdown(std::slice::from_ref(&p)));
        let choice = Select::new()
            .with_prompt(format!("Decision for {}", p.id))
            .items(options)
            .default(3)
            .interact()?;
        let status = match choice {
            0 => ProposalStatus::Approved,
            1 => ProposalStatus::Rejected,
            2 => ProposalStatus::Deferred,
            3 => continue,
            _ => break,
        };
        let rationale: String = Input::new()
            .with_prompt("Rationale (optional)")
            .allow_empty(true)
            .interact_text()?;
        let rationale = Some(rationale.trim().to_string()).filter(|r| !r.is_empty());
        match gate.decide(&p.id, status, rationale) {
            Ok(d) => println!("  {} -> {}", d.id, d.status),
            // Another reviewer may have decided it meanwhile.
            Err(e) => eprintln!("  {}", e),
        }
    }
    Ok(())
}

/// Write proposals as markdown, by default to stdout.
pub fn export(dir: &Path, output: Option<&Path>, status: Option<&str>) -> Result<()> {
    let proposals = open_gate(dir)?.list(parse_status(status)?)?;
    let md = render_markdown(&proposals);
    match output {
        Some(path) => {
            fs::write(path, &md)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {} proposal(s) to {}", proposals.len(), path.display());
        }
        None => print!("{}", md),
    }
    Ok(())
}

pub fn stats(dir: &Path, json: bool) -> Result<()> {
    let gate = open_gate(dir)?;
    let stats = gate.stats()?;
    if json {
        let outcomes = gate.labeled_outcomes()?;
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "stats": stats,
                "outcomes": outcomes,
            }))?
        );
        return Ok(());
    }
    println!("Proposals: {}", stats.total);
    println!("  Pending:  {}", stats.pending);
    println!("  Approved: {}", stats.approved);
    println!("  Rejected: {}", stats.rejected);
    println!("  Deferred: {}", stats.deferred);
    match stats.acceptance_rate {
        Some(rate) => println!("  Acceptance rate: {:.0}%", rate * 100.0),
        None => println!("  Acceptance rate: n/a"),
    }
    Ok(())
}
