//! Core types for the judge-model gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Attribution for logging and debugging.
///
/// Every request through the gateway carries attribution so the usage log
/// can say which pipeline stage made a call and which row it belonged to.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Evaluation job / row this request is part of.
    pub job_id: Option<Uuid>,
    /// Which code path made this call. Use a static string like
    /// "judge::single_side" or "judge::final_verdict".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Judge model specification.
#[derive(Debug, Clone)]
pub enum ChatModel {
    /// OpenRouter model, e.g. "openai/o3"
    OpenRouter(String),
}

impl ChatModel {
    pub fn openrouter(model_id: impl Into<String>) -> Self {
        ChatModel::OpenRouter(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            ChatModel::OpenRouter(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            ChatModel::OpenRouter(_) => "openrouter",
        }
    }
}

/// Request for a judge completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: ChatModel,
    pub messages: Vec<Message>,
    /// Sampling temperature. Judgments want 0.0.
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Whether to request JSON output from the provider.
    pub json_mode: bool,
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            json_mode: false,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from a judge completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    pub(crate) fn empty() -> Self {
        Self {
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Unknown("error".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_builder_defaults() {
        let req = ChatRequest::new(
            ChatModel::openrouter("test/model"),
            vec![Message::user("hi")],
            Attribution::new("test"),
        );
        assert_eq!(req.temperature, 0.0);
        assert!(req.max_tokens.is_none());
        assert!(!req.json_mode);
    }

    #[test]
    fn finish_reason_from_api_string() {
        assert_eq!(
            FinishReason::from(Some("stop".to_string())),
            FinishReason::Stop
        );
        assert_eq!(
            FinishReason::from(Some("length".to_string())),
            FinishReason::Length
        );
        assert!(matches!(FinishReason::from(None), FinishReason::Unknown(_)));
    }
}
