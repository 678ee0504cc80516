//! Sessions and their event buses.
//!
//! A session pairs one sandbox with an ordered event log. Runs are
//! submitted fire-and-forget; progress is observed by subscribing to
//! the bus, which replays the full log before going live. While a run
//! is active a poller diffs the sandbox's execution history and turns
//! fresh records into `code` and `plot` events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, RunObserver, RunOutcome};
use crate::artifacts;
use crate::config::AnalystConfig;
use crate::engine::ReasoningEngine;
use crate::event::{Event, EventType};
use crate::extract;
use crate::message::Message;
use crate::sandbox::{ExecutionHistory, MAX_OUTPUT_CHARS, Sandbox, truncate_output};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {0} already has an active run")]
    RunActive(String),
    #[error(transparent)]
    Sandbox(#[from] crate::sandbox::SandboxError),
}

/// Ordered event log plus live fan-out. Publishing appends to the log
/// and forwards to every subscriber under one lock, so no subscriber
/// can see a gap or a duplicate across the replay boundary.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

#[derive(Default)]
struct BusInner {
    events: Vec<Event>,
    listeners: Vec<mpsc::UnboundedSender<Event>>,
}

impl EventBus {
    pub async fn publish(&self, event: Event) {
        let mut inner = self.inner.lock().await;
        inner.events.push(event.clone());
        inner.listeners.retain(|tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                tracing::debug!("dropping dead event subscriber");
            }
            alive
        });
    }

    /// Full replay of past events plus a live receiver for new ones.
    pub async fn subscribe(&self) -> (Vec<Event>, mpsc::UnboundedReceiver<Event>) {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.listeners.push(tx);
        (inner.events.clone(), rx)
    }

    pub async fn events(&self) -> Vec<Event> {
        self.inner.lock().await.events.clone()
    }
}

pub struct SessionState {
    pub id: String,
    pub dataset_paths: Vec<PathBuf>,
    sandbox: Arc<Mutex<Sandbox>>,
    bus: Arc<EventBus>,
    run_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionState {
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub async fn subscribe(&self) -> (Vec<Event>, mpsc::UnboundedReceiver<Event>) {
        self.bus.subscribe().await
    }

    pub async fn is_running(&self) -> bool {
        self.run_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

pub struct SessionManager {
    engine: Arc<dyn ReasoningEngine>,
    config: AnalystConfig,
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn ReasoningEngine>, config: AnalystConfig) -> Self {
        Self {
            engine,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session with its own interpreter worker.
    pub async fn create_session(
        &self,
        dataset_paths: Vec<PathBuf>,
    ) -> Result<String, SessionError> {
        let sandbox = Sandbox::new(self.config.python_bin(), None).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(SessionState {
            id: id.clone(),
            dataset_paths,
            sandbox: Arc::new(Mutex::new(sandbox)),
            bus: Arc::new(EventBus::default()),
            run_task: Mutex::new(None),
        });
        self.sessions.lock().await.insert(id.clone(), session);
        tracing::info!(session = %id, "session created");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn subscribe(
        &self,
        id: &str,
    ) -> Result<(Vec<Event>, mpsc::UnboundedReceiver<Event>), SessionError> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(session.subscribe().await)
    }

    /// Remove a session, aborting any run still in flight.
    pub async fn remove_session(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if let Some(task) = session.run_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    /// Kick off a run. Returns immediately; progress arrives on the
    /// session's event bus. At most one run per session may be active.
    pub async fn submit(&self, id: &str, task: &str) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let mut run_slot = session.run_task.lock().await;
        if run_slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(SessionError::RunActive(id.to_string()));
        }

        // Clear leftovers from any previous run before the poller can
        // sample the history.
        let history = {
            let mut sandbox = session.sandbox.lock().await;
            sandbox.reset().await?;
            sandbox.history()
        };

        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        let agent = Agent::new(Arc::clone(&self.engine), self.config.clone())
            .with_sandbox(Arc::clone(&session.sandbox))
            .with_datasets(session.dataset_paths.clone())
            .with_observer(Arc::new(ReasoningTap { tx: tap_tx }));

        let done = CancellationToken::new();
        let poller = tokio::spawn(pump_execution_events(
            Arc::clone(&session.bus),
            history,
            done.clone(),
            self.config.poll_interval,
        ));
        let forwarder = tokio::spawn(forward_reasoning(Arc::clone(&session.bus), tap_rx));

        let bus = Arc::clone(&session.bus);
        let prompt = task.to_string();
        let handle = tokio::spawn(async move {
            bus.publish(Event::status("running")).await;
            let result = agent.run(&prompt).await;
            done.cancel();
            let _ = poller.await;
            // The agent holds the observer's sender; dropping it lets
            // the forwarder drain and exit.
            drop(agent);
            let _ = forwarder.await;
            match result {
                Ok(outcome) => emit_completion(&bus, &outcome).await,
                Err(e) => emit_failure(&bus, &e.to_string()).await,
            }
        });
        *run_slot = Some(handle);
        Ok(())
    }
}

/// Observer that taps `<think>` blocks out of assistant turns for the
/// bus. Runs inside the loop, so it only enqueues.
struct ReasoningTap {
    tx: mpsc::UnboundedSender<(usize, String)>,
}

impl RunObserver for ReasoningTap {
    fn on_iteration(
        &self,
        iteration: usize,
        message: &Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Message::Assistant { content, .. } = message
            && let Some(text) = extract::first("think", content)
        {
            let _ = self.tx.send((iteration, text));
        }
        Ok(())
    }
}

async fn forward_reasoning(
    bus: Arc<EventBus>,
    mut rx: mpsc::UnboundedReceiver<(usize, String)>,
) {
    while let Some((iteration, text)) = rx.recv().await {
        bus.publish(Event::new(
            EventType::Reasoning,
            json!({ "iteration": iteration, "text": text }),
        ))
        .await;
    }
}

/// Diff the execution history on an interval and publish events for
/// records not yet streamed. After the done signal fires, one final
/// drain closes the window where a record lands between the last poll
/// and completion.
async fn pump_execution_events(
    bus: Arc<EventBus>,
    history: ExecutionHistory,
    done: CancellationToken,
    interval: Duration,
) {
    let mut streamed = 0usize;
    loop {
        let finished = done.is_cancelled();
        drain_new_records(&bus, &history, &mut streamed).await;
        if finished {
            break;
        }
        tokio::select! {
            _ = done.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn drain_new_records(bus: &EventBus, history: &ExecutionHistory, streamed: &mut usize) {
    let records = history.snapshot();
    if records.len() < *streamed {
        // History was reset under us.
        *streamed = 0;
    }
    while *streamed < records.len() {
        let step = *streamed as u64;
        let record = &records[*streamed];
        bus.publish(Event::with_step(
            EventType::Code,
            json!({
                "code": record.code,
                "output": truncate_output(&record.output, MAX_OUTPUT_CHARS),
                "error": record.error,
                "succeeded": record.succeeded,
            }),
            step,
        ))
        .await;
        for (index, image) in record.images.iter().enumerate() {
            bus.publish(Event::with_step(
                EventType::Plot,
                json!({
                    "mime": image.mime,
                    "data": image.to_base64(),
                    "index": index,
                }),
                step,
            ))
            .await;
        }
        *streamed += 1;
    }
}

async fn emit_completion(bus: &EventBus, outcome: &RunOutcome) {
    if let Some(plan) = &outcome.plan {
        bus.publish(Event::new(EventType::Plan, json!({ "text": plan })))
            .await;
    }
    bus.publish(Event::new(
        EventType::AssistantMessage,
        json!({ "content": outcome.solution }),
    ))
    .await;
    bus.publish(Event::new(
        EventType::Metadata,
        json!({ "run_id": outcome.run_id, "iterations": outcome.iterations }),
    ))
    .await;
    if !outcome.artifact_paths.is_empty() {
        bus.publish(Event::new(
            EventType::Artifacts,
            json!({ "items": artifacts::describe(&outcome.artifact_paths) }),
        ))
        .await;
    }
    bus.publish(Event::status("completed")).await;
}

async fn emit_failure(bus: &EventBus, message: &str) {
    tracing::error!(error = message, "run failed");
    bus.publish(Event::error(message)).await;
    bus.publish(Event::status("failed")).await;
}
