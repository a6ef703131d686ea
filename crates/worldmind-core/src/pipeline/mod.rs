//! Pipeline driver.
//!
//! The driver owns all singletons (store, model, dispatcher, git, events,
//! oscillation detector) through explicit constructor wiring, runs one
//! stage at a time per mission, merges the returned delta into the mission
//! under the single-writer discipline, and persists after every stage.
//! The next stage is selected from the status field alone; there is no
//! stage graph beyond this match.

pub mod stages;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use worldmind_store::delta::MissionDelta;
use worldmind_store::models::{AgentRole, Mission, MissionStatus, TaskStatus};
use worldmind_store::store::MissionStore;

use crate::config::OrchestratorConfig;
use crate::dispatch::Dispatcher;
use crate::events::EventBus;
use crate::gate::DiagnosticFilter;
use crate::git::GitWorkspace;
use crate::llm::LanguageModel;
use crate::oscillation::OscillationDetector;
use crate::scheduler::next_wave;
use crate::wave::{WaveDispatcher, WaveEvaluator};

/// Source of project context for the upload-context stage. Project
/// scanning and language detection live outside the orchestrator; this is
/// their interface.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn gather(&self, project_path: Option<&Path>) -> Result<String>;
}

/// Context source that contributes nothing.
pub struct NullContextSource;

#[async_trait]
impl ContextSource for NullContextSource {
    async fn gather(&self, _project_path: Option<&Path>) -> Result<String> {
        Ok(String::new())
    }
}

/// The per-mission pipeline driver.
pub struct Pipeline {
    store: Arc<dyn MissionStore>,
    model: Arc<dyn LanguageModel>,
    events: EventBus,
    config: OrchestratorConfig,
    context_source: Arc<dyn ContextSource>,
    wave_dispatcher: WaveDispatcher,
    evaluator: WaveEvaluator,
    detector: Mutex<OscillationDetector>,
}

impl Pipeline {
    /// Wire up the driver. `git` is required for branch merging and
    /// worktree isolation; without it waves still run but nothing merges.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MissionStore>,
        model: Arc<dyn LanguageModel>,
        dispatcher: Arc<dyn Dispatcher>,
        git: Option<GitWorkspace>,
        events: EventBus,
        config: OrchestratorConfig,
        context_source: Arc<dyn ContextSource>,
        filter: DiagnosticFilter,
    ) -> Self {
        let wave_dispatcher = WaveDispatcher::new(
            Arc::clone(&dispatcher),
            git.clone(),
            events.clone(),
            config.clone(),
        );
        let evaluator = WaveEvaluator::new(
            dispatcher,
            git,
            events.clone(),
            config.clone(),
            filter,
        );
        Self {
            store,
            model,
            events,
            config,
            context_source,
            wave_dispatcher,
            evaluator,
            detector: Mutex::new(OscillationDetector::new()),
        }
    }

    /// Drive a mission until it parks (clarifying, awaiting approval) or
    /// reaches a terminal status.
    pub async fn run(&self, mission_id: Uuid, cancel: CancellationToken) -> Result<Mission> {
        let mut mission = self
            .store
            .load(mission_id)
            .await?
            .with_context(|| format!("mission {mission_id} not found"))?;

        self.recover_orphans(&mut mission).await?;
        let initially_terminal = mission.status.is_terminal();

        loop {
            match mission.status {
                // Parked on external input.
                MissionStatus::Clarifying | MissionStatus::AwaitingApproval => {
                    return Ok(mission);
                }
                status if status.is_terminal() => {
                    // A mission failed mid-wave still gets its metrics.
                    let delta = stages::converge_stage(&mission);
                    let converged_now = !delta.is_empty();
                    if converged_now {
                        delta.apply(&mut mission);
                        self.store.save(&mission).await?;
                    }
                    // Announce completion once, not on every later look.
                    if !initially_terminal || converged_now {
                        stages::post_mission_stage(self.model.as_ref(), &self.events, &mission)
                            .await;
                    }
                    return Ok(mission);
                }
                _ => {}
            }

            // Cooperative cancellation at the stage boundary.
            if cancel.is_cancelled() {
                MissionDelta::failed("mission cancelled").apply(&mut mission);
                self.store.save(&mission).await?;
                continue;
            }

            let before = mission.status;
            let delta = match self.step(&mission, &cancel).await {
                Ok(delta) => delta,
                Err(e) => {
                    // Only LLM and programmer errors reach this point.
                    tracing::error!(mission_id = %mission.id, error = %e, "stage failed");
                    MissionDelta::failed(format!("stage failed: {e}"))
                }
            };

            let advanced = delta.status.is_some();
            delta.apply(&mut mission);
            self.store.save(&mission).await?;

            // A validation stall: the stage appended errors but could not
            // advance (the mission never leaves `received`).
            if !advanced && mission.status == before && before != MissionStatus::Executing {
                return Ok(mission);
            }
        }
    }

    /// Select and run the stage for the current status.
    async fn step(&self, mission: &Mission, cancel: &CancellationToken) -> Result<MissionDelta> {
        match mission.status {
            MissionStatus::Received => {
                stages::classify_stage(self.model.as_ref(), mission).await
            }
            MissionStatus::Uploading => {
                stages::upload_context_stage(self.context_source.as_ref(), mission).await
            }
            MissionStatus::Specifying => stages::specify_stage(self.model.as_ref(), mission).await,
            MissionStatus::Planning => stages::plan_stage(self.model.as_ref(), mission).await,
            MissionStatus::Executing => self.executing_step(mission, cancel).await,
            MissionStatus::Clarifying
            | MissionStatus::AwaitingApproval
            | MissionStatus::Completed
            | MissionStatus::Failed => Ok(MissionDelta::default()),
        }
    }

    /// One iteration of the wave loop: schedule, dispatch, evaluate.
    async fn executing_step(
        &self,
        mission: &Mission,
        cancel: &CancellationToken,
    ) -> Result<MissionDelta> {
        let wave = next_wave(
            &mission.tasks,
            &mission.completed_task_ids,
            mission.strategy,
            self.config.max_parallel,
        );

        if wave.is_empty() {
            return Ok(stages::converge_stage(mission));
        }

        // Inter-wave cooldown for provider rate limits.
        if mission.current_wave > 0 && !self.config.wave_cooldown.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.config.wave_cooldown) => {}
                _ = cancel.cancelled() => {}
            }
        }

        tracing::info!(
            mission_id = %mission.id,
            wave = mission.current_wave,
            tasks = ?wave,
            "dispatching wave"
        );

        let mut detector = self.detector.lock().await;

        // A deployer wave follows its own protocol.
        if let [only] = wave.as_slice() {
            if mission.task(only).map(|t| t.role) == Some(AgentRole::Deployer) {
                return self
                    .evaluator
                    .run_deployer_wave(mission, only, &mut detector)
                    .await;
            }
        }

        let dispatched = self
            .wave_dispatcher
            .dispatch_wave(mission, &wave, cancel)
            .await?;
        self.evaluator
            .evaluate_wave(mission, &dispatched, &mut detector)
            .await
    }

    // -----------------------------------------------------------------------
    // External actions
    // -----------------------------------------------------------------------

    /// User approval: `awaiting_approval -> executing`.
    pub async fn approve(&self, mission_id: Uuid) -> Result<Mission> {
        let mut mission = self
            .store
            .load(mission_id)
            .await?
            .with_context(|| format!("mission {mission_id} not found"))?;
        if mission.status != MissionStatus::AwaitingApproval {
            anyhow::bail!(
                "mission {} has status {}, expected awaiting_approval",
                mission_id,
                mission.status
            );
        }
        MissionDelta::status(MissionStatus::Executing).apply(&mut mission);
        self.store.save(&mission).await?;
        Ok(mission)
    }

    /// User answers to clarifying questions: `clarifying -> specifying`.
    pub async fn answer(
        &self,
        mission_id: Uuid,
        answers: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Mission> {
        let mut mission = self
            .store
            .load(mission_id)
            .await?
            .with_context(|| format!("mission {mission_id} not found"))?;
        if mission.status != MissionStatus::Clarifying {
            anyhow::bail!(
                "mission {} has status {}, expected clarifying",
                mission_id,
                mission.status
            );
        }
        mission.clarification_answers.extend(answers);
        MissionDelta::status(MissionStatus::Specifying).apply(&mut mission);
        self.store.save(&mission).await?;
        Ok(mission)
    }

    /// Restart recovery: tasks caught mid-flight by a crash go back to
    /// pending so the next wave can pick them up.
    async fn recover_orphans(&self, mission: &mut Mission) -> Result<()> {
        let mut orphaned = Vec::new();
        for task in &mut mission.tasks {
            if matches!(task.status, TaskStatus::Executing | TaskStatus::Verifying) {
                task.status = TaskStatus::Pending;
                orphaned.push(task.id.clone());
            }
        }
        if !orphaned.is_empty() {
            tracing::warn!(
                mission_id = %mission.id,
                tasks = ?orphaned,
                "reset orphaned tasks to pending"
            );
            self.store.save(mission).await?;
        }
        Ok(())
    }
}
