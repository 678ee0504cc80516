//! Execution core for an autonomous data-analysis agent.
//!
//! A [`ReasoningEngine`] proposes code and tool calls; the [`Agent`]
//! loop runs them against a persistent Python [`Sandbox`] and feeds the
//! results back until the engine marks a `<solution>`. The session
//! layer wraps runs in an observable event bus for frontends.
//!
//! ```rust,ignore
//! let manager = SessionManager::new(engine, AnalystConfig::default());
//! let session = manager.create_session(vec![train_csv]).await?;
//! let (replay, mut events) = manager.subscribe(&session).await?;
//! manager.submit(&session, "Which feature predicts churn best?").await?;
//! while let Some(event) = events.recv().await { /* render */ }
//! ```

pub mod agent;
pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod event;
pub mod extract;
pub mod message;
pub mod prompt;
pub mod sandbox;
pub mod session;
pub mod tools;

pub use agent::{Agent, RunError, RunObserver, RunOutcome, RunStream, StepSnapshot};
pub use config::AnalystConfig;
pub use dataset::{DatasetError, DatasetResolver};
pub use engine::{EngineError, EngineResponse, ReasoningEngine};
pub use event::{Event, EventType};
pub use message::{ActionRequest, Message};
pub use sandbox::{
    ExecutionHistory, ExecutionRecord, PlotImage, Sandbox, SandboxError, TimeoutCapability,
};
pub use session::{EventBus, SessionError, SessionManager, SessionState};
pub use tools::{Tool, ToolDefinition, ToolOutput, ToolParam, ToolRegistry};
