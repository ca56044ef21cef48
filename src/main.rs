use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pevo")]
#[command(about = "promptevo - bandit-driven prompt evolution with a human approval gate")]
#[command(version)]
struct Cli {
    /// Path to the project directory (default: .promptevo in current dir)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Output as JSON for machine consumption
    #[arg(long, global = true)]
    json: bool,

    /// Debug-level logs on stderr (PROMPTEVO_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a promptevo project in the current directory
    Init,

    /// Evolve a seed prompt against a rubric
    RunEvolution {
        /// Seed prompt text
        #[arg(long, conflicts_with = "seed_file")]
        seed: Option<String>,

        /// Read the seed prompt from a file
        #[arg(long)]
        seed_file: Option<PathBuf>,

        /// Rubric file (.yaml, .toml or .json; default: <dir>/rubric.yaml)
        #[arg(long)]
        rubric: Option<PathBuf>,

        /// Token budget (overrides [budget].max_tokens)
        #[arg(long)]
        max_tokens: Option<u64>,

        /// Maximum generations (overrides [budget].max_generations)
        #[arg(long)]
        max_generations: Option<u32>,

        /// Wall-clock budget in seconds
        #[arg(long)]
        max_seconds: Option<f64>,

        /// Variants per generation
        #[arg(long)]
        variants: Option<usize>,

        /// Seed for stochastic strategies
        #[arg(long)]
        rng_seed: Option<u64>,

        /// Restrict the bandit to these strategies (can specify multiple)
        #[arg(long = "strategy", value_delimiter = ',')]
        strategies: Vec<String>,

        /// Stop after this many generations without a new champion
        #[arg(long)]
        patience: Option<u32>,

        /// Do not write the run report to <dir>/runs/
        #[arg(long)]
        no_save: bool,
    },

    /// Review and decide diff proposals
    Proposals {
        #[command(subcommand)]
        command: ProposalsCommand,
    },

    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Subcommand)]
enum ProposalsCommand {
    /// List proposals
    List {
        /// Filter by status (pending, approved, rejected, deferred)
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one proposal with its diff
    Show {
        /// Proposal ID (or unique prefix)
        id: String,
    },

    /// Record a decision
    Decide {
        /// Proposal ID (or unique prefix)
        id: String,

        /// approve, reject, or defer
        decision: String,

        /// Why
        #[arg(long, short)]
        rationale: Option<String>,
    },

    /// Walk through pending proposals interactively
    Review,

    /// Render proposals as markdown
    Export {
        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },

    /// Decision counts and acceptance rate
    Stats,
}

#[derive(Subcommand)]
enum RunsCommand {
    /// List recorded runs
    List,

    /// Show a run report
    Show {
        /// Run ID, or "latest"
        #[arg(default_value = "latest")]
        id: String,

        /// Include per-generation telemetry
        #[arg(long)]
        telemetry: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "promptevo=debug,pevo=debug" } else { "promptevo=info,pevo=info" };
    let filter = EnvFilter::try_from_env("PROMPTEVO_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let dir = cli.dir.unwrap_or_else(|| PathBuf::from(".promptevo"));

    match cli.command {
        Commands::Init => commands::init::run(&dir),
        Commands::RunEvolution {
            seed,
            seed_file,
            rubric,
            max_tokens,
            max_generations,
            max_seconds,
            variants,
            rng_seed,
            strategies,
            patience,
            no_save,
        } => {
            let args = commands::run_evolution::RunArgs {
                seed,
                seed_file,
                rubric,
                max_tokens,
                max_generations,
                max_seconds,
                variants,
                rng_seed,
                strategies,
                patience,
                save: !no_save,
            };
            let status = commands::run_evolution::run(&dir, args, cli.json)?;
            if status == promptevo::RunStatus::Error {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Proposals { command } => match command {
            ProposalsCommand::List { status } => {
                commands::proposals::list(&dir, status.as_deref(), cli.json)
            }
            ProposalsCommand::Show { id } => commands::proposals::show(&dir, &id, cli.json),
            ProposalsCommand::Decide {
                id,
                decision,
                rationale,
            } => commands::proposals::decide(&dir, &id, &decision, rationale, cli.json),
            ProposalsCommand::Review => commands::proposals::review(&dir),
            ProposalsCommand::Export { output, status } => {
                commands::proposals::export(&dir, output.as_deref(), status.as_deref())
            }
            ProposalsCommand::Stats => commands::proposals::stats(&dir, cli.json),
        },
        Commands::Runs { command } => match command {
            RunsCommand::List => commands::runs::list(&dir, cli.json),
            RunsCommand::Show { id, telemetry } => {
                commands::runs::show(&dir, &id, telemetry, cli.json)
            }
        },
    }
}
