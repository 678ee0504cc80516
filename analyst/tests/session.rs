//! End-to-end session tests with a scripted engine and a real
//! interpreter worker. Skip cleanly when `python3` is unavailable.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use analyst_core::{
    ActionRequest, AnalystConfig, EngineError, EngineResponse, Event, EventType, Message,
    ReasoningEngine, SessionError, SessionManager,
};

struct Scripted {
    responses: Mutex<VecDeque<EngineResponse>>,
    delay: Duration,
}

impl Scripted {
    fn new(responses: Vec<EngineResponse>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            delay,
        })
    }
}

#[async_trait::async_trait]
impl ReasoningEngine for Scripted {
    async fn invoke(&self, _messages: &[Message]) -> Result<EngineResponse, EngineError> {
        tokio::time::sleep(self.delay).await;
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EngineError::Provider("script exhausted".into()))
    }
}

fn config() -> AnalystConfig {
    AnalystConfig {
        poll_interval: Duration::from_millis(10),
        artifacts_dir: std::env::temp_dir().join("analyst-session-tests"),
        ..AnalystConfig::default()
    }
}

async fn create_session(manager: &SessionManager) -> Option<String> {
    match manager.create_session(Vec::new()).await {
        Ok(id) => Some(id),
        Err(e) => {
            eprintln!("skipping: cannot spawn python3 ({e})");
            None
        }
    }
}

async fn collect_until_terminal(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("bus closed before terminal status");
        let terminal = event.kind == EventType::Status
            && matches!(event.payload["stage"].as_str(), Some("completed" | "failed"));
        events.push(event);
        if terminal {
            return events;
        }
    }
}

#[tokio::test]
async fn run_emits_full_event_sequence() {
    let engine = Scripted::new(
        vec![
            EngineResponse {
                text: "<plan>print then answer</plan><think>start simple</think>".into(),
                actions: vec![ActionRequest::new(
                    "run_python",
                    json!({"code": "print('hi')"}),
                )],
            },
            EngineResponse::text("<solution>it prints hi</solution>"),
        ],
        Duration::ZERO,
    );
    let manager = SessionManager::new(engine, config());
    let Some(id) = create_session(&manager).await else { return };

    let (replay, mut rx) = manager.subscribe(&id).await.unwrap();
    assert!(replay.is_empty());

    manager.submit(&id, "say hi").await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    let kinds: Vec<EventType> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds[0], EventType::Status);
    assert_eq!(events[0].payload["stage"], "running");
    assert!(kinds.contains(&EventType::Reasoning));

    let code = events
        .iter()
        .find(|e| e.kind == EventType::Code)
        .expect("no code event");
    assert_eq!(code.payload["code"], "print('hi')");
    assert_eq!(code.payload["output"], "hi\n");
    assert_eq!(code.step, Some(0));

    // Completion tail ordering.
    let tail: Vec<EventType> = kinds[kinds.len() - 4..].to_vec();
    assert_eq!(
        tail,
        vec![
            EventType::Plan,
            EventType::AssistantMessage,
            EventType::Metadata,
            EventType::Status,
        ]
    );
    let answer = events
        .iter()
        .find(|e| e.kind == EventType::AssistantMessage)
        .unwrap();
    assert_eq!(answer.payload["content"], "it prints hi");

    // A late subscriber replays the identical log.
    let (full_replay, _rx2) = manager.subscribe(&id).await.unwrap();
    let replay_ids: Vec<&str> = full_replay.iter().map(|e| e.event_id.as_str()).collect();
    let live_ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(replay_ids, live_ids);
}

#[tokio::test]
async fn second_submit_while_running_is_rejected() {
    let engine = Scripted::new(
        vec![EngineResponse::text("<solution>slow and steady</solution>")],
        Duration::from_millis(500),
    );
    let manager = SessionManager::new(engine, config());
    let Some(id) = create_session(&manager).await else { return };

    let (_, mut rx) = manager.subscribe(&id).await.unwrap();
    manager.submit(&id, "first").await.unwrap();
    let err = manager.submit(&id, "second").await.unwrap_err();
    assert!(matches!(err, SessionError::RunActive(_)));

    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(events.last().unwrap().payload["stage"], "completed");

    // After the run finishes the session accepts work again. The task
    // handle can lag the final event by a moment, so poll briefly.
    for attempt in 0.. {
        match manager.submit(&id, "third").await {
            Ok(()) => break,
            Err(SessionError::RunActive(_)) if attempt < 100 => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[tokio::test]
async fn engine_failure_yields_error_then_failed_status() {
    let engine = Scripted::new(Vec::new(), Duration::ZERO);
    let manager = SessionManager::new(engine, config());
    let Some(id) = create_session(&manager).await else { return };

    let (_, mut rx) = manager.subscribe(&id).await.unwrap();
    manager.submit(&id, "doomed").await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    let tail: Vec<EventType> = events[events.len() - 2..].iter().map(|e| e.kind).collect();
    assert_eq!(tail, vec![EventType::Error, EventType::Status]);
    assert_eq!(events.last().unwrap().payload["stage"], "failed");
    assert!(
        events[events.len() - 2].payload["message"]
            .as_str()
            .unwrap()
            .contains("script exhausted")
    );
}

#[tokio::test]
async fn unknown_session_is_reported() {
    let engine = Scripted::new(Vec::new(), Duration::ZERO);
    let manager = SessionManager::new(engine, config());
    let err = manager.submit("nope", "task").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
    let err = manager.subscribe("nope").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}
