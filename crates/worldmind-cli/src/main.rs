mod config;
mod context;
mod model;
mod run_cmd;
mod status_cmd;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use uuid::Uuid;

use worldmind_store::models::{ExecutionStrategy, ReasoningLevel};

use config::WorldmindConfig;

#[derive(Parser)]
#[command(name = "worldmind", about = "Mission orchestrator for fleets of agent workers")]
struct Cli {
    /// Mission store directory (overrides WORLDMIND_STORE_DIR env var)
    #[arg(long, global = true)]
    store_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a worldmind config file with defaults
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Submit a mission and drive it
    Run {
        /// The engineering request, in natural language
        request: String,
        /// Path of the project working copy
        #[arg(long)]
        project: Option<String>,
        /// Git remote the workers push branches to
        #[arg(long)]
        git_remote: Option<String>,
        /// Execution strategy: sequential or parallel
        #[arg(long)]
        strategy: Option<String>,
        /// Reasoning level: low, medium, or high
        #[arg(long)]
        reasoning: Option<String>,
        /// Maximum number of concurrent workers
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// Resume a mission from its persisted state
    Resume {
        /// Mission ID to resume
        mission_id: String,
    },
    /// Approve a mission awaiting approval and continue it
    Approve {
        /// Mission ID to approve
        mission_id: String,
    },
    /// Answer clarifying questions and continue the mission
    Answer {
        /// Mission ID to answer for
        mission_id: String,
        /// Answers as question=answer pairs (repeatable)
        #[arg(long = "answer", value_name = "QUESTION=ANSWER")]
        answers: Vec<String>,
    },
    /// Show mission status and task progress
    Status {
        /// Mission ID to show
        mission_id: String,
    },
    /// List all missions
    Missions,
    /// Delete a mission and its event log
    Delete {
        /// Mission ID to delete
        mission_id: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worldmind=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store_dir = cli.store_dir.as_deref();

    match cli.command {
        Commands::Init { force } => init(force),
        Commands::Run {
            request,
            project,
            git_remote,
            strategy,
            reasoning,
            max_parallel,
        } => {
            let config = WorldmindConfig::resolve(store_dir, max_parallel)?;
            let options = run_cmd::RunOptions {
                request,
                project_path: project,
                git_remote,
                strategy: parse_opt::<ExecutionStrategy>(strategy, "strategy")?,
                reasoning: parse_opt::<ReasoningLevel>(reasoning, "reasoning")?,
            };
            run_cmd::run(config, options).await
        }
        Commands::Resume { mission_id } => {
            let config = WorldmindConfig::resolve(store_dir, None)?;
            run_cmd::resume(config, parse_mission_id(&mission_id)?).await
        }
        Commands::Approve { mission_id } => {
            let config = WorldmindConfig::resolve(store_dir, None)?;
            run_cmd::approve(config, parse_mission_id(&mission_id)?).await
        }
        Commands::Answer {
            mission_id,
            answers,
        } => {
            let config = WorldmindConfig::resolve(store_dir, None)?;
            let answers = answers
                .iter()
                .map(|pair| {
                    pair.split_once('=')
                        .map(|(q, a)| (q.trim().to_owned(), a.trim().to_owned()))
                        .with_context(|| format!("expected question=answer, got {pair:?}"))
                })
                .collect::<Result<Vec<_>>>()?;
            run_cmd::answer(config, parse_mission_id(&mission_id)?, answers).await
        }
        Commands::Status { mission_id } => {
            let config = WorldmindConfig::resolve(store_dir, None)?;
            status_cmd::status(config, parse_mission_id(&mission_id)?).await
        }
        Commands::Missions => {
            let config = WorldmindConfig::resolve(store_dir, None)?;
            status_cmd::missions(config).await
        }
        Commands::Delete { mission_id } => {
            let config = WorldmindConfig::resolve(store_dir, None)?;
            status_cmd::delete(config, parse_mission_id(&mission_id)?).await
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_owned();
            clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

fn init(force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    config::save_config(&config::ConfigFile::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

fn parse_mission_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("invalid mission id: {raw:?}"))
}

fn parse_opt<T>(raw: Option<String>, what: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {what}: {e}")),
    }
}
