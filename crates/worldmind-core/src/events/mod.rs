//! Best-effort event stream.
//!
//! Events are published fire-and-forget onto a bounded channel with a
//! single consumer. The bus is non-transactional: when the channel is
//! full or the consumer is gone, the event is dropped and the pipeline
//! continues. Ordering within a task is preserved because events are
//! published from the wave thread that owns the task.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// The closed set of event types the orchestrator emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum EventType {
    TaskStarted,
    TaskPhase,
    TaskFulfilled,
    TaskProgress,
    TaskFailed,
    ContainerOpened,
    QualityGateGranted,
    QualityGateDenied,
    WaveMerged,
    WaveCompleted,
    DeployerSuccess,
    DeployerFailed,
    MissionCompleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskStarted => "task.started",
            Self::TaskPhase => "task.phase",
            Self::TaskFulfilled => "task.fulfilled",
            Self::TaskProgress => "task.progress",
            Self::TaskFailed => "task.failed",
            Self::ContainerOpened => "container.opened",
            Self::QualityGateGranted => "quality_gate.granted",
            Self::QualityGateDenied => "quality_gate.denied",
            Self::WaveMerged => "wave.merged",
            Self::WaveCompleted => "wave.completed",
            Self::DeployerSuccess => "deployer.success",
            Self::DeployerFailed => "deployer.failed",
            Self::MissionCompleted => "mission.completed",
        };
        f.write_str(s)
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.to_string()
    }
}

/// Task phases reported through `task.phase` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Coder,
    Tester,
    Reviewer,
    QualityGate,
    Build,
    Push,
    Verify,
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coder => "CODER",
            Self::Tester => "TESTER",
            Self::Reviewer => "REVIEWER",
            Self::QualityGate => "QUALITY_GATE",
            Self::Build => "BUILD",
            Self::Push => "PUSH",
            Self::Verify => "VERIFY",
        };
        f.write_str(s)
    }
}

/// One entry of the append-only event log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorEvent {
    pub event_type: EventType,
    pub mission_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub payload: BTreeMap<String, String>,
    pub timestamp_ms: i64,
}

impl OrchestratorEvent {
    pub fn new(event_type: EventType, mission_id: Uuid) -> Self {
        Self {
            event_type,
            mission_id,
            task_id: None,
            payload: BTreeMap::new(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Publishing half of the event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity, returning the bus and
    /// the single consumer end.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// A bus whose consumer is already gone; every publish is a drop.
    pub fn disabled() -> Self {
        let (bus, rx) = Self::new(1);
        drop(rx);
        bus
    }

    /// Publish an event without blocking. A full channel or a departed
    /// consumer drops the event.
    pub fn publish(&self, event: OrchestratorEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(error = %e, "dropping orchestrator event");
        }
    }

    pub fn task_phase(&self, mission_id: Uuid, task_id: &str, phase: TaskPhase) {
        self.publish(
            OrchestratorEvent::new(EventType::TaskPhase, mission_id)
                .task(task_id)
                .with("phase", phase.to_string()),
        );
    }
}

/// Spawn the single consumer: append each event as one JSON line to `path`.
///
/// Both the file open and every write are best-effort; failures are logged
/// and never reach the pipeline.
pub fn spawn_jsonl_sink(
    rx: mpsc::Receiver<OrchestratorEvent>,
    path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = ReceiverStream::new(rx);

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;

        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "event sink unavailable");
                // Drain so publishers never observe a full channel forever.
                while stream.next().await.is_some() {}
                return;
            }
        };

        while let Some(event) = stream.next().await {
            let mut line = match serde_json::to_vec(&event) {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize event");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = file.write_all(&line).await {
                tracing::warn!(error = %e, "failed to append event");
            }
        }
        if let Err(e) = file.flush().await {
            tracing::warn!(error = %e, "failed to flush event sink");
        }
    })
}
