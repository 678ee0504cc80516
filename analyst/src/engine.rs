use crate::message::{ActionRequest, Message};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine provider error: {0}")]
    Provider(String),
    #[error("engine returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// One turn of engine output: free text plus zero or more tool requests.
#[derive(Debug, Clone, Default)]
pub struct EngineResponse {
    pub text: String,
    pub actions: Vec<ActionRequest>,
}

impl EngineResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            actions: Vec::new(),
        }
    }
}

/// The reasoning side of the loop. Implementations wrap whatever model
/// provider the caller uses; the core only ever sees the transcript in
/// and an [`EngineResponse`] out.
#[async_trait::async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn invoke(&self, messages: &[Message]) -> Result<EngineResponse, EngineError>;
}
