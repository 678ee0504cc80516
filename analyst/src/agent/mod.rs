//! The Generate/Act loop that drives a run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::AnalystConfig;
use crate::engine::{EngineError, ReasoningEngine};
use crate::extract;
use crate::message::{ActionRequest, Message};
use crate::prompt;
use crate::sandbox::{ExecutionRecord, Sandbox, SandboxError, save_plots};
use crate::tools::{DatasetInfo, RunPython, ToolRegistry};

/// Trailing transcript window inspected for repeated actions.
const LOOP_WINDOW: usize = 16;
/// Advisory fires when at least this many tool calls sit in the window
/// while the distinct action names stay at or below [`LOOP_MAX_DISTINCT`].
const LOOP_MIN_CALLS: usize = 8;
const LOOP_MAX_DISTINCT: usize = 2;

const BUDGET_SOLUTION: &str =
    "<solution>Maximum iterations reached before a final answer was produced.</solution>";
const LOOP_NUDGE: &str = "You have repeated the same action many times without new progress. \
     Step back, reconsider the approach, and move toward a final <solution>.";

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Per-iteration hook. A failing observer never affects the run.
pub trait RunObserver: Send + Sync {
    fn on_iteration(
        &self,
        iteration: usize,
        message: &Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub solution: String,
    pub plan: Option<String>,
    pub messages: Vec<Message>,
    pub execution_history: Vec<ExecutionRecord>,
    pub artifact_paths: Vec<PathBuf>,
    pub iterations: usize,
}

impl RunOutcome {
    /// Dump the transcript as a readable text log under `dir`,
    /// returning the file path.
    pub fn write_log(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let mut text = format!(
            "run: {}\niterations: {}\nplan: {}\n",
            self.run_id,
            self.iterations,
            self.plan.as_deref().unwrap_or("(none)"),
        );
        for message in &self.messages {
            text.push_str(&format!("\n=== {} ===\n{}\n", message.role(), message.content()));
        }
        let path = dir.join(format!("{}.log", self.run_id));
        std::fs::write(&path, text)?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Generate,
    Act,
    Terminated,
}

struct RunState {
    run_id: String,
    messages: Vec<Message>,
    iterations: usize,
    plan: Option<String>,
    pending: Vec<ActionRequest>,
    phase: Phase,
    nudged: bool,
}

/// One state transition of a streamed run.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// `"generate"` or `"act"`.
    pub node: &'static str,
    pub iteration: usize,
    pub messages: Vec<Message>,
}

pub struct Agent {
    engine: Arc<dyn ReasoningEngine>,
    tools: Arc<ToolRegistry>,
    sandbox: Option<Arc<Mutex<Sandbox>>>,
    dataset_paths: Vec<PathBuf>,
    config: AnalystConfig,
    observer: Option<Arc<dyn RunObserver>>,
}

impl Agent {
    pub fn new(engine: Arc<dyn ReasoningEngine>, config: AnalystConfig) -> Self {
        Self {
            engine,
            tools: Arc::new(ToolRegistry::new()),
            sandbox: None,
            dataset_paths: Vec::new(),
            config,
            observer: None,
        }
    }

    /// Attach a sandbox and wire up the standard tool set against it.
    pub fn with_sandbox(mut self, sandbox: Arc<Mutex<Sandbox>>) -> Self {
        self.tools = Arc::new(
            ToolRegistry::new()
                .register(RunPython::new(Arc::clone(&sandbox), self.config.exec_timeout))
                .register(DatasetInfo),
        );
        self.sandbox = Some(sandbox);
        self
    }

    /// Replace the tool set entirely.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_datasets(mut self, paths: Vec<PathBuf>) -> Self {
        self.dataset_paths = paths;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run to completion.
    pub async fn run(&self, task: &str) -> Result<RunOutcome, RunError> {
        let mut state = self.init_run(task).await?;
        while state.phase != Phase::Terminated {
            self.step(&mut state).await?;
        }
        self.finish(state).await
    }

    /// Start a lazily-stepped run. Each `next()` performs one state
    /// transition and yields a snapshot; every call to `stream` starts
    /// a fresh run.
    pub async fn stream(&self, task: &str) -> Result<RunStream<'_>, RunError> {
        let state = self.init_run(task).await?;
        Ok(RunStream { agent: self, state })
    }

    async fn init_run(&self, task: &str) -> Result<RunState, RunError> {
        let run_id = make_run_id(&self.dataset_paths);
        tracing::info!(%run_id, "starting run");

        if let Some(sandbox) = &self.sandbox {
            let mut sandbox = sandbox.lock().await;
            sandbox.reset().await?;
            let vars = dataset_vars(&self.dataset_paths);
            if !vars.is_empty() {
                sandbox.inject(vars).await?;
            }
        }

        let system = prompt::system_prompt(
            &self.dataset_paths,
            &self.tools.definitions(),
            self.config.planning_mode,
        );
        Ok(RunState {
            run_id,
            messages: vec![Message::system(system), Message::user(task)],
            iterations: 0,
            plan: None,
            pending: Vec::new(),
            phase: Phase::Generate,
            nudged: false,
        })
    }

    async fn step(&self, state: &mut RunState) -> Result<(), RunError> {
        match state.phase {
            Phase::Generate => self.generate(state).await,
            Phase::Act => self.act(state).await,
            Phase::Terminated => Ok(()),
        }
    }

    async fn generate(&self, state: &mut RunState) -> Result<(), RunError> {
        if state.iterations >= self.config.max_iterations {
            tracing::warn!(
                run_id = %state.run_id,
                max = self.config.max_iterations,
                "iteration budget exhausted"
            );
            state.messages.push(Message::assistant(BUDGET_SOLUTION));
            state.phase = Phase::Terminated;
            return Ok(());
        }
        state.iterations += 1;

        let response = self.engine.invoke(&state.messages).await?;
        // A revised plan supersedes earlier ones.
        if let Some(plan) = extract::first("plan", &response.text) {
            state.plan = Some(plan);
        }

        let message = Message::Assistant {
            content: response.text.clone(),
            actions: response.actions.clone(),
        };
        if let Some(observer) = &self.observer
            && let Err(e) = observer.on_iteration(state.iterations, &message)
        {
            tracing::debug!(%e, "run observer failed");
        }
        state.messages.push(message);

        if extract::contains_solution(&response.text) || response.actions.is_empty() {
            state.phase = Phase::Terminated;
        } else {
            state.pending = response.actions;
            state.phase = Phase::Act;
        }
        Ok(())
    }

    async fn act(&self, state: &mut RunState) -> Result<(), RunError> {
        let pending = std::mem::take(&mut state.pending);
        for action in pending {
            let output = self.tools.dispatch(&action).await;
            if !output.success {
                tracing::debug!(tool = %action.name, "tool call failed");
            }
            state.messages.push(Message::ToolResult {
                call_id: action.id,
                name: action.name,
                content: output.content,
            });
        }

        if !state.nudged
            && let Some((calls, distinct)) = detect_repetition(&state.messages)
        {
            tracing::warn!(
                run_id = %state.run_id,
                calls,
                distinct,
                "repeated actions detected, nudging"
            );
            state.messages.push(Message::system(LOOP_NUDGE));
            state.nudged = true;
        }

        state.phase = Phase::Generate;
        Ok(())
    }

    async fn finish(&self, state: RunState) -> Result<RunOutcome, RunError> {
        let solution = state
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::Assistant { content, .. } => Some(extract::solution(content)),
                _ => None,
            })
            .unwrap_or_default();

        let execution_history = match &self.sandbox {
            Some(sandbox) => sandbox.lock().await.snapshot_history(),
            None => Vec::new(),
        };

        let plot_dir = self.config.artifacts_dir.join(&state.run_id);
        let artifact_paths = if execution_history.iter().any(|r| !r.images.is_empty()) {
            match save_plots(&execution_history, &plot_dir) {
                Ok(paths) => paths,
                Err(e) => {
                    tracing::warn!(%e, "failed to save plots");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        tracing::info!(
            run_id = %state.run_id,
            iterations = state.iterations,
            artifacts = artifact_paths.len(),
            "run finished"
        );
        Ok(RunOutcome {
            run_id: state.run_id,
            solution,
            plan: state.plan,
            messages: state.messages,
            execution_history,
            artifact_paths,
            iterations: state.iterations,
        })
    }
}

/// A lazily-driven run. Exhausts with `None`, after which [`finish`]
/// yields the outcome.
///
/// [`finish`]: RunStream::finish
pub struct RunStream<'a> {
    agent: &'a Agent,
    state: RunState,
}

impl RunStream<'_> {
    pub async fn next(&mut self) -> Option<Result<StepSnapshot, RunError>> {
        if self.state.phase == Phase::Terminated {
            return None;
        }
        let node = if self.state.phase == Phase::Generate {
            "generate"
        } else {
            "act"
        };
        match self.agent.step(&mut self.state).await {
            Ok(()) => Some(Ok(StepSnapshot {
                node,
                iteration: self.state.iterations,
                messages: self.state.messages.clone(),
            })),
            Err(e) => {
                self.state.phase = Phase::Terminated;
                Some(Err(e))
            }
        }
    }

    pub async fn finish(self) -> Result<RunOutcome, RunError> {
        self.agent.finish(self.state).await
    }
}

fn make_run_id(dataset_paths: &[PathBuf]) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let stem = dataset_paths
        .first()
        .and_then(|p| p.file_stem())
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "run".to_string());
    format!("{stamp}_{stem}")
}

fn dataset_vars(paths: &[PathBuf]) -> serde_json::Map<String, serde_json::Value> {
    let mut vars = serde_json::Map::new();
    if let Some(first) = paths.first() {
        vars.insert(
            "DATASET_PATH".to_string(),
            serde_json::json!(first.display().to_string()),
        );
    }
    if !paths.is_empty() {
        let all: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        vars.insert("DATASET_PATHS".to_string(), serde_json::json!(all));
    }
    vars
}

/// Trailing-window repetition check: `(calls, distinct)` when the
/// recent tool calls collapse onto very few action names.
fn detect_repetition(messages: &[Message]) -> Option<(usize, usize)> {
    let window = &messages[messages.len().saturating_sub(LOOP_WINDOW)..];
    let names: Vec<&str> = window
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    if names.len() < LOOP_MIN_CALLS {
        return None;
    }
    let distinct: std::collections::HashSet<&str> = names.iter().copied().collect();
    if distinct.len() <= LOOP_MAX_DISTINCT {
        Some((names.len(), distinct.len()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineResponse;
    use crate::tools::{Tool, ToolDefinition, ToolOutput, ToolParam};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        responses: StdMutex<VecDeque<EngineResponse>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(responses: Vec<EngineResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ReasoningEngine for Scripted {
        async fn invoke(&self, _messages: &[Message]) -> Result<EngineResponse, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| EngineError::Provider("script exhausted".into()))
        }
    }

    /// Always asks for the same tool, forever.
    struct Repeater {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ReasoningEngine for Repeater {
        async fn invoke(&self, _messages: &[Message]) -> Result<EngineResponse, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(EngineResponse {
                text: "<think>trying again</think>".into(),
                actions: vec![ActionRequest::new("probe", json!({}))],
            })
        }
    }

    struct Probe;

    #[async_trait::async_trait]
    impl Tool for Probe {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "probe".into(),
                description: "Test probe.".into(),
                params: vec![ToolParam {
                    name: "x".into(),
                    r#type: "str".into(),
                    description: "ignored".into(),
                    required: false,
                }],
                returns: "str".into(),
            }
        }

        async fn execute(&self, _args: &serde_json::Value) -> ToolOutput {
            ToolOutput::ok("probed")
        }
    }

    fn config(max_iterations: usize) -> AnalystConfig {
        AnalystConfig {
            max_iterations,
            ..AnalystConfig::default()
        }
    }

    #[tokio::test]
    async fn test_solution_terminates_run() {
        let engine = Scripted::new(vec![EngineResponse::text(
            "<plan>just answer</plan><solution>42</solution>",
        )]);
        let agent = Agent::new(engine.clone(), config(5));
        let outcome = agent.run("what is the answer").await.unwrap();
        assert_eq!(outcome.solution, "42");
        assert_eq!(outcome.plan.as_deref(), Some("just answer"));
        assert_eq!(outcome.iterations, 1);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_revised_plan_supersedes_earlier_one() {
        let engine = Scripted::new(vec![
            EngineResponse {
                text: "<plan>fit a linear model</plan>".into(),
                actions: vec![ActionRequest::new("probe", json!({}))],
            },
            EngineResponse {
                text: "<plan>the data is categorical, cross-tabulate instead</plan>".into(),
                actions: vec![ActionRequest::new("probe", json!({}))],
            },
            EngineResponse::text("<solution>done</solution>"),
        ]);
        let agent = Agent::new(engine, config(5))
            .with_tools(ToolRegistry::new().register(Probe));
        let outcome = agent.run("task").await.unwrap();
        assert_eq!(
            outcome.plan.as_deref(),
            Some("the data is categorical, cross-tabulate instead")
        );
    }

    #[tokio::test]
    async fn test_tool_results_feed_back_into_transcript() {
        let engine = Scripted::new(vec![
            EngineResponse {
                text: "let me check".into(),
                actions: vec![ActionRequest::new("probe", json!({}))],
            },
            EngineResponse::text("<solution>done</solution>"),
        ]);
        let agent = Agent::new(engine.clone(), config(5))
            .with_tools(ToolRegistry::new().register(Probe));
        let outcome = agent.run("task").await.unwrap();
        assert!(outcome.messages.iter().any(|m| matches!(
            m,
            Message::ToolResult { name, content, .. } if name == "probe" && content == "probed"
        )));
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_synthesizes_solution() {
        let engine = Arc::new(Repeater {
            calls: AtomicUsize::new(0),
        });
        let agent = Agent::new(engine.clone(), config(3))
            .with_tools(ToolRegistry::new().register(Probe));
        let outcome = agent.run("task").await.unwrap();
        // The engine runs exactly to the budget, then the loop answers for it.
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.iterations, 3);
        let last = outcome.messages.last().unwrap();
        assert!(last.content().contains("<solution>"));
        assert!(outcome.solution.contains("Maximum iterations reached"));
    }

    #[tokio::test]
    async fn test_unknown_action_becomes_error_result() {
        let engine = Scripted::new(vec![
            EngineResponse {
                text: "calling".into(),
                actions: vec![ActionRequest::new("no_such_tool", json!({}))],
            },
            EngineResponse::text("<solution>recovered</solution>"),
        ]);
        let agent = Agent::new(engine, config(5));
        let outcome = agent.run("task").await.unwrap();
        assert!(outcome.messages.iter().any(|m| matches!(
            m,
            Message::ToolResult { content, .. } if content.contains("Unknown tool")
        )));
        assert_eq!(outcome.solution, "recovered");
    }

    #[tokio::test]
    async fn test_engine_error_propagates() {
        let engine = Scripted::new(vec![EngineResponse {
            text: "checking".into(),
            actions: vec![ActionRequest::new("probe", json!({}))],
        }]);
        let agent = Agent::new(engine, config(5))
            .with_tools(ToolRegistry::new().register(Probe));
        let err = agent.run("task").await.unwrap_err();
        assert!(matches!(err, RunError::Engine(_)));
    }

    #[tokio::test]
    async fn test_repetition_nudge_appears_once() {
        let engine = Arc::new(Repeater {
            calls: AtomicUsize::new(0),
        });
        let agent = Agent::new(engine, config(12))
            .with_tools(ToolRegistry::new().register(Probe));
        let outcome = agent.run("task").await.unwrap();
        let nudges = outcome
            .messages
            .iter()
            .filter(|m| matches!(m, Message::System { content } if content.contains("repeated")))
            .count();
        assert_eq!(nudges, 1);
        // Advisory only: the run still ran its full budget.
        assert_eq!(outcome.iterations, 12);
    }

    #[tokio::test]
    async fn test_observer_failure_is_ignored() {
        struct Failing;
        impl RunObserver for Failing {
            fn on_iteration(
                &self,
                _iteration: usize,
                _message: &Message,
            ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                Err("observer exploded".into())
            }
        }
        let engine = Scripted::new(vec![EngineResponse::text("<solution>fine</solution>")]);
        let agent = Agent::new(engine, config(5)).with_observer(Arc::new(Failing));
        let outcome = agent.run("task").await.unwrap();
        assert_eq!(outcome.solution, "fine");
    }

    #[tokio::test]
    async fn test_stream_yields_transitions() {
        let engine = Scripted::new(vec![
            EngineResponse {
                text: "step one".into(),
                actions: vec![ActionRequest::new("probe", json!({}))],
            },
            EngineResponse::text("<solution>streamed</solution>"),
        ]);
        let agent = Agent::new(engine, config(5))
            .with_tools(ToolRegistry::new().register(Probe));
        let mut stream = agent.stream("task").await.unwrap();
        let mut nodes = Vec::new();
        while let Some(step) = stream.next().await {
            nodes.push(step.unwrap().node);
        }
        assert_eq!(nodes, vec!["generate", "act", "generate"]);
        let outcome = stream.finish().await.unwrap();
        assert_eq!(outcome.solution, "streamed");
    }

    #[tokio::test]
    async fn test_stream_restarts_fresh() {
        let engine = Scripted::new(vec![
            EngineResponse::text("<solution>first</solution>"),
            EngineResponse::text("<solution>second</solution>"),
        ]);
        let agent = Agent::new(engine, config(5));
        let mut first = agent.stream("task").await.unwrap();
        while first.next().await.is_some() {}
        let mut second = agent.stream("task").await.unwrap();
        let step = second.next().await.unwrap().unwrap();
        assert_eq!(step.iteration, 1);
        assert_eq!(second.finish().await.unwrap().solution, "second");
    }

    #[test]
    fn test_detect_repetition_thresholds() {
        let mut messages = Vec::new();
        for _ in 0..7 {
            messages.push(Message::ToolResult {
                call_id: "c".into(),
                name: "probe".into(),
                content: "x".into(),
            });
        }
        assert!(detect_repetition(&messages).is_none());
        messages.push(Message::ToolResult {
            call_id: "c".into(),
            name: "probe".into(),
            content: "x".into(),
        });
        assert_eq!(detect_repetition(&messages), Some((8, 1)));
    }

    #[test]
    fn test_detect_repetition_varied_names_ok() {
        let names = ["a", "b", "c", "d"];
        let messages: Vec<Message> = (0..12)
            .map(|i| Message::ToolResult {
                call_id: "c".into(),
                name: names[i % names.len()].into(),
                content: "x".into(),
            })
            .collect();
        assert!(detect_repetition(&messages).is_none());
    }

    #[test]
    fn test_write_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let outcome = RunOutcome {
            run_id: "20260101_000000_test".into(),
            solution: "42".into(),
            plan: Some("plan".into()),
            messages: vec![Message::user("hi"), Message::assistant("<solution>42</solution>")],
            execution_history: Vec::new(),
            artifact_paths: Vec::new(),
            iterations: 1,
        };
        let path = outcome.write_log(dir.path()).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("run: 20260101_000000_test"));
        assert!(text.contains("=== user ===\nhi"));
    }
}
