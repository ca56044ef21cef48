use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use promptevo::config::Config;

/// Default content for .promptevo/.gitignore
const GITIGNORE_CONTENT: &str = r#"# promptevo gitignore
# Per-generation telemetry (can be large)
telemetry.jsonl

# Never commit credentials (API keys belong in ~/.config/promptevo/)
credentials.toml
*.secret
"#;

/// Starter rubric written by `pevo init`.
const RUBRIC_TEMPLATE: &str = r#"# Concepts use `|` for alternatives: "severity|priority" matches either.
rubric:
  version: v1
  weights:
    accuracy: 0.5
    completeness: 0.3
    clarity: 0.2
  pass_threshold: 80.0

tests:
  - name: triage
    scenario: "A customer reports the checkout page times out for EU users."
    expected_concepts: ["severity|priority", "owner", "next steps"]
    forbidden_concepts: ["ignore"]
  - name: summary
    scenario: "Summarise yesterday's incident for the on-call channel."
    expected_concepts: ["impact", "root cause", "follow-up"]
"#;

pub fn run(dir: &Path) -> Result<()> {
    if dir.join("config.toml").exists() {
        anyhow::bail!("promptevo already initialized at {}", dir.display());
    }

    Config::init(dir)?;

    let rubric_path = dir.join("rubric.yaml");
    if !rubric_path.exists() {
        fs::write(&rubric_path, RUBRIC_TEMPLATE).context("Failed to create rubric.yaml")?;
    }

    // Create .gitignore to protect against accidental credential commits
    fs::write(dir.join(".gitignore"), GITIGNORE_CONTENT).context("Failed to create .gitignore")?;

    println!("Initialized promptevo at {}", dir.display());
    println!("  Edit {} to describe your test scenarios.", rubric_path.display());
    Ok(())
}
