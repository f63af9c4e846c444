use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use foreman::config::BuildConfig;
use foreman::runner::{BuildResult, Orchestrator};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Autonomous software-engineering orchestrator")]
struct Cli {
    /// Target repository (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Path to a JSON config file. Unknown options are rejected.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a goal into a dependency-sorted issue graph without executing.
    Plan { goal: String },
    /// Full pipeline: plan, execute, verify.
    Build { goal: String },
    /// Continue a crashed or cancelled build from its checkpoint.
    Resume {
        /// Artifacts directory (defaults to <repo>/.artifacts).
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Show the state of the last run.
    Status {
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<BuildConfig> {
    let Some(path) = path else {
        return Ok(BuildConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    Ok(BuildConfig::from_value(value)?)
}

fn print_build_result(result: &BuildResult) {
    println!();
    println!(
        "{} {}",
        style("Build:").bold(),
        style(&result.summary).cyan()
    );
    let b = &result.breakdown;
    println!(
        "  issues: {} planned, {} completed, {} failed, {} skipped",
        b.planned_issues, b.completed, b.failed, b.skipped
    );
    if b.replans > 0 {
        println!("  replans: {}", b.replans);
    }
    if let Some(passed) = b.verify_passed {
        println!(
            "  verification: {}",
            if passed {
                style("passed").green()
            } else {
                style("failed").red()
            }
        );
    }
    if !result.debt.is_empty() {
        println!("  {}", style(format!("debt register ({}):", result.debt.len())).yellow());
        for item in &result.debt {
            println!(
                "    [{:?}/{:?}] {}: {}",
                item.kind,
                item.severity,
                item.issue_name,
                if item.criterion.is_empty() {
                    &item.justification
                } else {
                    &item.criterion
                }
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    foreman::logging::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let repo = cli
        .repo
        .canonicalize()
        .with_context(|| format!("repository path {} not found", cli.repo.display()))?;

    match cli.command {
        Commands::Plan { goal } => {
            let orchestrator = Orchestrator::new(config)?;
            let plan = orchestrator.plan(&goal, &repo).await?;
            println!(
                "{} {} issues in {} levels",
                style("Planned:").bold(),
                plan.issues.len(),
                plan.levels.len()
            );
            for (idx, level) in plan.levels.iter().enumerate() {
                println!("  level {idx}: {}", level.join(", "));
            }
            if !plan.file_conflicts.is_empty() {
                println!(
                    "  {}",
                    style(format!(
                        "{} advisory file conflicts (the merger will handle them)",
                        plan.file_conflicts.len()
                    ))
                    .yellow()
                );
            }
        }
        Commands::Build { goal } => {
            let orchestrator = Orchestrator::new(config)?;
            let result = orchestrator.build(&goal, &repo).await?;
            print_build_result(&result);
        }
        Commands::Resume { artifacts } => {
            let orchestrator = Orchestrator::new(config)?;
            let result = orchestrator.resume_build(&repo, artifacts.as_deref()).await?;
            print_build_result(&result);
        }
        Commands::Status { artifacts } => {
            let artifacts_dir = artifacts
                .unwrap_or_else(|| Orchestrator::default_artifacts_dir(&repo));
            let store = foreman::artifacts::ArtifactStore::new(&artifacts_dir);
            match store.load_checkpoint() {
                Some(state) => {
                    println!("{} run {}", style("Checkpoint:").bold(), state.run_id);
                    println!(
                        "  level {}/{}, version {}",
                        state.current_level,
                        state.levels.len(),
                        state.version
                    );
                    println!("  {}", state.summary());
                }
                None => println!("No checkpoint found under {}", artifacts_dir.display()),
            }
        }
    }

    Ok(())
}
