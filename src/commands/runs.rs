//! `pevo runs`: list and show recorded run reports.

use anyhow::Result;
use std::path::Path;

use promptevo::candidate::short_id;
use promptevo::run_store;
use promptevo::telemetry::read_records;

/// List all recorded runs.
pub fn list(dir: &Path, json: bool) -> Result<()> {
    let ids = run_store::list_runs(dir)?;
    if ids.is_empty() {
        if json {
            println!("[]");
        } else {
            println!("No runs found.");
        }
        return Ok(());
    }

    let mut reports = Vec::new();
    for id in &ids {
        match run_store::load_report(dir, id) {
            Ok(r) => reports.push(r),
            Err(e) => eprintln!("Warning: could not load report for {}: {}", id, e),
        }
    }

    if json {
        let rows: Vec<_> = reports
            .iter()
            .map(|r| {
                serde_json::json!({
                    "run_id": r.run_id,
                    "status": r.status,
                    "generations": r.generations.len(),
                    "seed_score": r.seed_score,
                    "champion_score": r.champion.score(),
                    "tokens": r.total_tokens(),
                    "started_at": r.started_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("Runs:\n");
        for r in &reports {
            println!(
                "  {} {:<16} {:>3} gen  {:5.1} -> {:5.1}  {} tokens  ({})",
                r.run_id,
                r.status.as_str(),
                r.generations.len(),
                r.seed_score,
                r.champion.score(),
                r.total_tokens(),
                r.started_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}

/// Show one run, optionally with its telemetry records.
pub fn show(dir: &Path, run_id: &str, telemetry: bool, json: bool) -> Result<()> {
    let report = run_store::load_report(dir, run_id)?;
    let records = if telemetry {
        read_records(&dir.join("telemetry.jsonl"), Some(&report.run_id))?
    } else {
        Vec::new()
    };

    if json {
        if telemetry {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "report": report,
                    "telemetry": records,
                }))?
            );
        } else {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        return Ok(());
    }

    println!("Run: {}", report.run_id);
    println!("  Status: {}", report.status);
    if let Some(ref reason) = report.stop_reason {
        println!("  Stopped: {}", reason);
    }
    if let Some(ref error) = report.error {
        println!("  Error: {}", error);
    }
    println!(
        "  Seed: {} ({:.1})",
        short_id(&report.seed_id),
        report.seed_score
    );
    println!(
        "  Champion: {} ({:.1}, since generation {})",
        short_id(&report.champion.candidate.id),
        report.champion.score(),
        report.champion.generation
    );
    println!(
        "  Budget: {}/{} tokens, {:.1}/{:.0}s",
        report.budget.tokens_spent,
        report.budget.max_tokens,
        report.budget.seconds_elapsed,
        report.budget.max_seconds
    );

    println!("  Arms:");
    for arm in report.arms.values() {
        println!(
            "    {:<18} pulls {:<3} mean reward {:.3}",
            arm.name,
            arm.pulls,
            arm.mean_reward()
        );
    }

    println!("  Generations ({}):", report.generations.len());
    for g in &report.generations {
        let score = g
            .report
            .as_ref()
            .map(|r| format!("{:5.1}", r.composite))
            .unwrap_or_else(|| "    -".to_string());
        println!(
            "    {:>3} {:<18} {} reward {:.3} tokens {:<6}{}",
            g.index,
            g.arm,
            score,
            g.reward,
            g.tokens,
            if g.became_champion { " *champion" } else { "" }
        );
    }

    if telemetry {
        println!("  Telemetry records: {}", records.len());
        for r in &records {
            println!(
                "    gen {:>3} {:<18} {:>6}ms novelty {}{}",
                r.generation,
                r.arm,
                r.latency_ms,
                r.novelty.map(|n| format!("{:.2}", n)).unwrap_or_else(|| "-".to_string()),
                if r.budget.tokens_low || r.budget.time_low { "  [budget low]" } else { "" }
            );
        }
    }

    println!();
    println!("Champion content:");
    println!("{}", report.champion.candidate.content);
    Ok(())
}
