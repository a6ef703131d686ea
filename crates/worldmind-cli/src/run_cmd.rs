//! Mission execution commands: `run`, `resume`, `approve`, `answer`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use worldmind_core::dispatch::Dispatcher;
use worldmind_core::dispatch::local::{LocalContainerConfig, LocalContainerDispatcher};
use worldmind_core::dispatch::remote::{RemoteRunnerConfig, RemoteTaskDispatcher};
use worldmind_core::events::{EventBus, spawn_jsonl_sink};
use worldmind_core::gate::DiagnosticFilter;
use worldmind_core::git::GitWorkspace;
use worldmind_core::pipeline::Pipeline;
use worldmind_store::models::{ExecutionStrategy, Mission, MissionStatus, ReasoningLevel};
use worldmind_store::store::{JsonFileStore, MissionStore};

use crate::config::WorldmindConfig;
use crate::context::DirectoryListingSource;
use crate::model::CommandModel;

/// Options for creating a new mission.
pub struct RunOptions {
    pub request: String,
    pub project_path: Option<String>,
    pub git_remote: Option<String>,
    pub strategy: Option<ExecutionStrategy>,
    pub reasoning: Option<ReasoningLevel>,
}

/// `worldmind run`: create a mission and drive it.
pub async fn run(config: WorldmindConfig, options: RunOptions) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(&config.store_dir)?);

    let mut mission = Mission::new(options.request);
    mission.project_path = options.project_path;
    mission.git_remote_url = options.git_remote;
    if let Some(strategy) = options.strategy {
        mission.strategy = strategy;
    }
    if let Some(reasoning) = options.reasoning {
        mission.reasoning_level = reasoning;
    }
    store.save(&mission).await?;
    println!("mission {} created", mission.id);

    drive(config, store, mission.id).await
}

/// `worldmind resume`: re-enter the pipeline at the current status.
pub async fn resume(config: WorldmindConfig, mission_id: Uuid) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(&config.store_dir)?);
    drive(config, store, mission_id).await
}

/// `worldmind approve`: release a mission into execution, then drive it.
pub async fn approve(config: WorldmindConfig, mission_id: Uuid) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(&config.store_dir)?);
    let pipeline = build_pipeline(&config, Arc::clone(&store), mission_id).await?;
    pipeline.approve(mission_id).await?;
    println!("mission {mission_id} approved");
    drive(config, store, mission_id).await
}

/// `worldmind answer`: record clarification answers, then drive on.
pub async fn answer(
    config: WorldmindConfig,
    mission_id: Uuid,
    answers: Vec<(String, String)>,
) -> Result<()> {
    if answers.is_empty() {
        bail!("no answers given; use --answer question=answer");
    }
    let store = Arc::new(JsonFileStore::new(&config.store_dir)?);
    let pipeline = build_pipeline(&config, Arc::clone(&store), mission_id).await?;
    pipeline.answer(mission_id, answers).await?;
    drive(config, store, mission_id).await
}

/// Drive a mission until it parks or terminates, with ctrl-c mapped to
/// cooperative cancellation.
async fn drive(config: WorldmindConfig, store: Arc<JsonFileStore>, mission_id: Uuid) -> Result<()> {
    let events_path = store.events_path(mission_id);
    let (pipeline, sink) =
        build_pipeline_with_events(&config, Arc::clone(&store), mission_id, events_path).await?;

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight tasks");
            cancel_on_signal.cancel();
        }
    });

    let mission = pipeline.run(mission_id, cancel).await?;
    drop(pipeline);
    let _ = sink.await;

    report(&mission);
    Ok(())
}

fn report(mission: &Mission) {
    println!("mission {} is {}", mission.id, mission.status);
    match mission.status {
        MissionStatus::Clarifying => {
            println!("answer these questions with `worldmind answer {} --answer ...`:", mission.id);
            for question in &mission.clarifying_questions {
                println!("  - {question}");
            }
        }
        MissionStatus::AwaitingApproval => {
            println!("planned tasks:");
            for task in &mission.tasks {
                println!("  {} [{}] {}", task.id, task.role, task.description);
            }
            println!("approve with `worldmind approve {}`", mission.id);
        }
        _ => {
            for task in &mission.tasks {
                println!(
                    "  {} [{}] {} (iteration {})",
                    task.id, task.role, task.status, task.iteration
                );
            }
            if let Some(ref metrics) = mission.metrics {
                println!(
                    "  {} completed, {} failed, {} waves, {} ms",
                    metrics.tasks_completed,
                    metrics.tasks_failed,
                    metrics.waves_executed,
                    metrics.total_duration_ms
                );
            }
            for error in &mission.errors {
                println!("  error: {error}");
            }
        }
    }
}

/// Wire the pipeline singletons for one mission.
async fn build_pipeline(
    config: &WorldmindConfig,
    store: Arc<JsonFileStore>,
    mission_id: Uuid,
) -> Result<Pipeline> {
    let events_path = store.events_path(mission_id);
    let (pipeline, sink) =
        build_pipeline_with_events(config, store, mission_id, events_path).await?;
    sink.abort();
    Ok(pipeline)
}

async fn build_pipeline_with_events(
    config: &WorldmindConfig,
    store: Arc<JsonFileStore>,
    mission_id: Uuid,
    events_path: PathBuf,
) -> Result<(Pipeline, tokio::task::JoinHandle<()>)> {
    let mission = store
        .load(mission_id)
        .await?
        .with_context(|| format!("mission {mission_id} not found"))?;

    let git = git_workspace(config, &mission);
    let dispatcher = build_dispatcher(config, &mission)?;
    let model = Arc::new(CommandModel::new(
        config.model.command.clone(),
        config.model.args.clone(),
    ));

    let (events, rx) = EventBus::new(256);
    let sink = spawn_jsonl_sink(rx, events_path);

    let pipeline = Pipeline::new(
        store,
        model,
        dispatcher,
        git,
        events,
        config.orchestrator.clone(),
        Arc::new(DirectoryListingSource),
        DiagnosticFilter::default(),
    );
    Ok((pipeline, sink))
}

fn git_workspace(config: &WorldmindConfig, mission: &Mission) -> Option<GitWorkspace> {
    if let Some(ref remote) = mission.git_remote_url {
        let root = config
            .store_dir
            .join("workspaces")
            .join(mission.id.to_string());
        return Some(GitWorkspace::new(root, Some(remote.clone()), "main"));
    }
    // Worktree isolation over a local repository, no merge target.
    if config.orchestrator.worktrees_enabled {
        if let Some(ref path) = mission.project_path {
            return Some(GitWorkspace::new(path, None, "main"));
        }
    }
    None
}

fn build_dispatcher(
    config: &WorldmindConfig,
    mission: &Mission,
) -> Result<Arc<dyn Dispatcher>> {
    match config.dispatch.provider.as_str() {
        "local" => Ok(Arc::new(LocalContainerDispatcher::new(
            LocalContainerConfig {
                image: config.dispatch.image.clone(),
                extra_flags: config.dispatch.extra_flags.clone(),
            },
        ))),
        "remote" => {
            let command = config
                .dispatch
                .runner_command
                .clone()
                .context("dispatch.runner_command is required for the remote provider")?;
            Ok(Arc::new(RemoteTaskDispatcher::new(RemoteRunnerConfig {
                runner_command: command,
                runner_args: config.dispatch.runner_args.clone(),
                base_branch: "main".to_owned(),
                scratch_dir: config
                    .store_dir
                    .join("scratch")
                    .join(mission.id.to_string()),
            })))
        }
        other => bail!("unknown dispatch provider {other:?} (expected \"local\" or \"remote\")"),
    }
}
