use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use phone_pilot::{
    AgentSettings, CompletionRequest, ContextMessage, Model, NativeCall, RawResponse, Role,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const TEMPERATURE: f64 = 0.2;

/// OpenAI-compatible chat-completions client.
pub struct Brain {
    client: Client,
    api_key: String,
    endpoint: String,
    model_name: String,
}

impl Brain {
    pub fn new(settings: &AgentSettings) -> Result<Self> {
        if settings.api_key.trim().is_empty() {
            bail!("no API key configured (set OPENAI_API_KEY or pass --api-key)");
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            model_name: settings.model_name.clone(),
        })
    }
}

#[async_trait]
impl Model for Brain {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<RawResponse> {
        let messages = build_messages(request.instruction, request.context);
        if messages.len() > 40 {
            warn!(messages = messages.len(), "conversation is getting long");
        }

        let mut body = json!({
            "model": self.model_name,
            "messages": messages,
            "temperature": TEMPERATURE,
        });
        if let Some(tools) = request.tools {
            let tools: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("required");
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let json_resp: Value = response
            .json()
            .await
            .context("reading completion response")?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            return Err(anyhow!("model API error ({status}): {err_msg}"));
        }

        let reply = decode_reply(&json_resp)?;
        debug!(?reply, "model replied");
        Ok(reply)
    }
}

/// System instruction first, then the context. Screenshots become image parts.
fn build_messages(instruction: &str, context: &[ContextMessage]) -> Vec<Value> {
    let mut messages = Vec::with_capacity(context.len() + 1);
    messages.push(json!({"role": "system", "content": instruction}));

    for message in context {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = match &message.screenshot {
            Some(png) => json!([
                {"type": "text", "text": message.text},
                {
                    "type": "image_url",
                    "image_url": {"url": format!("data:image/png;base64,{}", BASE64.encode(png))}
                }
            ]),
            None => json!(message.text),
        };
        messages.push(json!({"role": role, "content": content}));
    }
    messages
}

fn decode_reply(json_resp: &Value) -> Result<RawResponse> {
    let message = &json_resp["choices"][0]["message"];
    let content = message["content"].as_str().map(str::to_string);

    if let Some(call) = message["tool_calls"].get(0) {
        let function = &call["function"];
        let name = function["name"]
            .as_str()
            .ok_or_else(|| anyhow!("tool call without a function name: {call}"))?;
        let arguments = match &function["arguments"] {
            Value::String(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            other => other.clone(),
        };
        return Ok(RawResponse::Call(NativeCall {
            name: name.to_string(),
            arguments,
            reasoning: content.filter(|c| !c.trim().is_empty()),
        }));
    }

    content
        .map(RawResponse::Text)
        .ok_or_else(|| anyhow!("no content in model response: {json_resp}"))
}
