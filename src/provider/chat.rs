//! Chat completions.

use serde::{Deserialize, Serialize};

use super::{CallKind, ProviderCall, ProviderRequest, ProviderResponse};
use crate::error::{Error, Result};

/// Attempts per (model, credential) for chat calls.
pub const CHAT_MAX_ATTEMPTS: usize = 3;
/// Sampling temperature used unless overridden.
pub const DEFAULT_TEMPERATURE: f32 = 0.05;
/// Nucleus sampling mass used unless overridden.
pub const DEFAULT_TOP_P: f32 = 0.1;

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// System instruction.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    /// User turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    /// Assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    messages: Vec<ChatMessage>,
    temperature: f32,
    top_p: f32,
}

impl ChatRequest {
    /// Single user prompt with an optional system instruction.
    pub fn new(system: Option<&str>, prompt: impl Into<String>) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        Self::from_messages(messages)
    }

    /// Continues an existing conversation with a new user prompt.
    pub fn with_history(history: &[ChatMessage], prompt: impl Into<String>) -> Self {
        let mut messages = history.to_vec();
        messages.push(ChatMessage::user(prompt));
        Self::from_messages(messages)
    }

    /// Uses `messages` verbatim.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
        }
    }

    /// Overrides the sampling parameters.
    pub fn sampling(mut self, temperature: f32, top_p: f32) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self
    }

    /// Messages in send order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

/// Text returned by a chat model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCompletion {
    /// Model that produced the answer.
    pub model: String,
    /// Assistant message content.
    pub content: String,
}

impl ProviderCall for ChatRequest {
    type Output = ChatCompletion;

    fn kind(&self) -> CallKind {
        CallKind::Chat
    }

    fn max_attempts(&self) -> usize {
        CHAT_MAX_ATTEMPTS
    }

    fn request(&self, model: &str) -> Result<ProviderRequest> {
        let body = ChatBody {
            model,
            messages: &self.messages,
            temperature: self.temperature,
            top_p: self.top_p,
        };
        let body = serde_json::to_value(&body)
            .map_err(|err| Error::Config(format!("failed to encode chat request: {err}")))?;
        Ok(ProviderRequest::json("chat/completions", body))
    }

    fn parse(&self, model: &str, response: &ProviderResponse) -> Result<ChatCompletion> {
        parse_completion(model, &response.body)
    }
}

/// Extracts `choices[0].message.content` from a chat completion body.
pub(crate) fn parse_completion(model: &str, body: &str) -> Result<ChatCompletion> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|err| Error::malformed(model, format!("invalid chat completion JSON: {err}")))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| Error::malformed(model, "chat completion has no message content"))?;
    Ok(ChatCompletion {
        model: model.to_string(),
        content,
    })
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}
