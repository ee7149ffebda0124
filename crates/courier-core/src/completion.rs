use async_trait::async_trait;
use serde::Serialize;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Sampling parameters sent with every completion request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 500,
        }
    }
}

/// A single-exchange completion request: system prompt plus one user message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn single_turn(system_prompt: &str, user_text: &str, sampling: Sampling) -> Self {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessage {
                role: Role::System,
                content: system_prompt.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: Role::User,
            content: user_text.to_string(),
        });
        Self {
            messages,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            max_tokens: sampling.max_tokens,
        }
    }
}

/// Port for the external text-completion endpoint.
///
/// Implementations map non-success responses and malformed bodies to
/// `Error::TransientApi`; the caller owns the timeout.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<String>;
}
