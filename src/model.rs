//! Model collaborator contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::ToolDefinition;
use crate::types::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the ongoing exchange with the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub text: String,
    /// PNG bytes. Only the newest user message keeps its screenshot.
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
}

impl ContextMessage {
    pub fn user(text: impl Into<String>, screenshot: Option<Vec<u8>>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            screenshot,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            screenshot: None,
        }
    }
}

/// A structured call from a native tool-calling model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    /// Free text the model emitted alongside the call, if any.
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawResponse {
    Text(String),
    Call(NativeCall),
}

impl RawResponse {
    /// How the reply is echoed back into the context on later turns.
    pub fn to_context_text(&self) -> String {
        match self {
            RawResponse::Text(text) => text.clone(),
            RawResponse::Call(call) => {
                let invocation = format!("{}({})", call.name, call.arguments);
                match call.reasoning.as_deref().map(str::trim) {
                    Some(reasoning) if !reasoning.is_empty() => {
                        format!("{reasoning}\n{invocation}")
                    }
                    _ => invocation,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub context: &'a [ContextMessage],
    pub instruction: &'a str,
    pub dialect: Dialect,
    /// Set for the native dialect only.
    pub tools: Option<&'a [ToolDefinition]>,
}

#[async_trait]
pub trait Model: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> anyhow::Result<RawResponse>;
}
