//! Wave dispatcher.
//!
//! Runs the tasks of one wave concurrently, bounded by a semaphore of
//! `max_parallel` permits. Each task gets its own spawned thread of
//! execution; within a thread work is serial, across threads there is no
//! ordering. The dispatcher works from a snapshot of the mission and
//! returns collected results; it never touches the live mission state, so
//! no lock is held across any suspension point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use worldmind_store::models::{
    ContainerInfo, Mission, Task, TaskStatus, WaveDispatchResult,
};

use crate::config::OrchestratorConfig;
use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::events::{EventBus, EventType, OrchestratorEvent, TaskPhase};
use crate::git::GitWorkspace;

/// Header under which the mission-level retry context reaches the worker.
const RETRY_CONTEXT_HEADER: &str = "## Retry Context (from previous attempt)";

/// Everything observed while dispatching one wave.
#[derive(Debug, Default)]
pub struct DispatchedWave {
    /// One result per task, ordered by task id.
    pub results: Vec<WaveDispatchResult>,
    /// Observed task states (status, files affected, elapsed time).
    pub tasks: Vec<Task>,
    pub containers: Vec<ContainerInfo>,
    /// Whether the mission retry context was consumed by this wave.
    pub retry_context_consumed: bool,
}

struct TaskDone {
    result: WaveDispatchResult,
    task: Task,
    container: Option<ContainerInfo>,
}

/// Dispatches the tasks of a single wave.
pub struct WaveDispatcher {
    dispatcher: Arc<dyn Dispatcher>,
    git: Option<GitWorkspace>,
    events: EventBus,
    config: OrchestratorConfig,
}

impl WaveDispatcher {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        git: Option<GitWorkspace>,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            dispatcher,
            git,
            events,
            config,
        }
    }

    /// Dispatch every task of `wave` concurrently and collect the results.
    ///
    /// The mission retry context, when present, is appended once to each
    /// dispatched task's input context; the caller clears it from mission
    /// state after this wave (single-consumer discipline).
    ///
    /// Cancellation is cooperative: tasks that have not yet acquired a
    /// permit return failed results; in-flight dispatcher calls run to
    /// completion and their results are still collected.
    pub async fn dispatch_wave(
        &self,
        mission: &Mission,
        wave: &[String],
        cancel: &CancellationToken,
    ) -> Result<DispatchedWave> {
        let mut dispatched = DispatchedWave {
            retry_context_consumed: mission.retry_context.is_some(),
            ..Default::default()
        };
        if wave.is_empty() {
            return Ok(dispatched);
        }

        // Worktree isolation: make sure the shared mission workspace exists
        // before any per-task worktree is carved out of it.
        let git = if self.config.worktrees_enabled {
            if let Some(ref git) = self.git {
                git.ensure_workspace().await?;
            }
            self.git.clone()
        } else {
            None
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
        let (tx, mut rx) = mpsc::channel::<TaskDone>(wave.len());
        let mut in_flight = 0usize;

        for task_id in wave {
            let Some(task) = mission.task(task_id) else {
                tracing::error!(task_id = %task_id, "wave references unknown task");
                continue;
            };

            let mut task = task.clone();
            if let Some(ref retry) = mission.retry_context {
                // Single-consumer read of the mission retry context.
                if task.input_context.is_empty() {
                    task.input_context = format!("{RETRY_CONTEXT_HEADER}\n\n{retry}");
                } else {
                    task.input_context =
                        format!("{}\n\n{RETRY_CONTEXT_HEADER}\n\n{retry}", task.input_context);
                }
            }
            task.status = TaskStatus::Executing;

            let dispatcher = Arc::clone(&self.dispatcher);
            let git = git.clone();
            let events = self.events.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let tx = tx.clone();
            let timeout = self.config.task_timeout;
            let wave_number = mission.current_wave;
            let mission_id = mission.id;
            let project_path = PathBuf::from(
                mission.project_path.clone().unwrap_or_else(|| ".".to_owned()),
            );
            let project_context = mission.project_context.clone();
            let git_remote_url = mission.git_remote_url.clone();
            let runtime_tag = mission.runtime_tag.clone();
            let reasoning_level = mission.reasoning_level;

            in_flight += 1;

            tokio::spawn(async move {
                // Acquire a permit, unless cancellation arrives first; no
                // new work starts after an interrupt.
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit,
                    _ = cancel.cancelled() => {
                        let done = cancelled_task(task, wave_number);
                        let _ = tx.send(done).await;
                        return;
                    }
                };
                let _permit = match permit {
                    Ok(p) => p,
                    Err(_) => {
                        let done = cancelled_task(task, wave_number);
                        let _ = tx.send(done).await;
                        return;
                    }
                };

                events.publish(
                    OrchestratorEvent::new(EventType::TaskStarted, mission_id)
                        .task(&task.id)
                        .with("role", task.role.to_string())
                        .with("iteration", task.iteration.to_string()),
                );
                if task.role.produces_code() {
                    events.task_phase(mission_id, &task.id, TaskPhase::Coder);
                }

                // Acquire a worktree for the task branch when isolation is on.
                let mut effective_path = project_path;
                if let Some(ref git) = git {
                    match git.acquire_worktree(&task.id).await {
                        Ok(path) => effective_path = path,
                        Err(e) => {
                            tracing::warn!(task_id = %task.id, error = %e, "worktree unavailable, using project path");
                        }
                    }
                }

                let request = DispatchRequest {
                    task: task.clone(),
                    project_context,
                    project_path: effective_path.clone(),
                    git_remote_url,
                    runtime_tag,
                    reasoning_level,
                };

                let started = Instant::now();
                let done = match tokio::time::timeout(timeout, dispatcher.execute(request)).await {
                    Ok(Ok(outcome)) => {
                        let mut observed = outcome.task;
                        // Worker output only becomes visible to the merge
                        // step once the task branch carries it.
                        if observed.status == TaskStatus::Passed {
                            if let Some(ref git) = git {
                                if let Err(e) = git
                                    .commit_and_push(&effective_path, &observed.id, observed.iteration)
                                    .await
                                {
                                    tracing::warn!(task_id = %observed.id, error = %e, "failed to push task branch");
                                }
                            }
                        }

                        events.publish(
                            OrchestratorEvent::new(EventType::ContainerOpened, mission_id)
                                .task(&observed.id)
                                .with("containerId", outcome.container.container_id.clone())
                                .with("provider", outcome.container.provider.clone()),
                        );
                        // Code tasks still face the gate, so a successful
                        // dispatch is only progress for them.
                        let event_type = if observed.status != TaskStatus::Passed {
                            EventType::TaskFailed
                        } else if observed.role.produces_code() {
                            EventType::TaskProgress
                        } else {
                            EventType::TaskFulfilled
                        };
                        events.publish(
                            OrchestratorEvent::new(event_type, mission_id).task(&observed.id),
                        );

                        TaskDone {
                            result: WaveDispatchResult {
                                task_id: observed.id.clone(),
                                wave: wave_number,
                                status: observed.status,
                                files_affected: observed.files_affected.clone(),
                                output: outcome.output,
                                elapsed_ms: observed.elapsed_ms,
                            },
                            task: observed,
                            container: Some(outcome.container),
                        }
                    }
                    Ok(Err(e)) => {
                        // Infrastructure error: synthesise a failed result.
                        tracing::error!(task_id = %task.id, error = %e, "dispatcher error");
                        events.publish(
                            OrchestratorEvent::new(EventType::TaskFailed, mission_id)
                                .task(&task.id)
                                .with("error", e.to_string()),
                        );
                        failed_task(task, wave_number, e.to_string(), started)
                    }
                    Err(_elapsed) => {
                        tracing::warn!(task_id = %task.id, "dispatcher call timed out");
                        events.publish(
                            OrchestratorEvent::new(EventType::TaskFailed, mission_id)
                                .task(&task.id)
                                .with("error", "task timed out"),
                        );
                        failed_task(task, wave_number, "task timed out".to_owned(), started)
                    }
                };

                let _ = tx.send(done).await;
            });
        }
        drop(tx);

        while in_flight > 0 {
            match rx.recv().await {
                Some(done) => {
                    in_flight -= 1;
                    dispatched.results.push(done.result);
                    dispatched.tasks.push(done.task);
                    if let Some(container) = done.container {
                        dispatched.containers.push(container);
                    }
                }
                None => break,
            }
        }

        // Completion order is nondeterministic; the evaluator and the merge
        // step require id order.
        dispatched.results.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        dispatched.tasks.sort_by(|a, b| a.id.cmp(&b.id));
        dispatched.containers.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        Ok(dispatched)
    }
}

fn failed_task(
    mut task: Task,
    wave: u32,
    error: String,
    started: Instant,
) -> TaskDone {
    task.status = TaskStatus::Failed;
    task.elapsed_ms = started.elapsed().as_millis() as u64;
    TaskDone {
        result: WaveDispatchResult {
            task_id: task.id.clone(),
            wave,
            status: TaskStatus::Failed,
            files_affected: Vec::new(),
            output: error,
            elapsed_ms: task.elapsed_ms,
        },
        container: None,
        task,
    }
}

fn cancelled_task(mut task: Task, wave: u32) -> TaskDone {
    task.status = TaskStatus::Failed;
    TaskDone {
        result: WaveDispatchResult {
            task_id: task.id.clone(),
            wave,
            status: TaskStatus::Failed,
            files_affected: Vec::new(),
            output: "cancelled before dispatch".to_owned(),
            elapsed_ms: 0,
        },
        container: None,
        task,
    }
}
