//! LLM provider gateway client — not a component of its own (§1 Non-goals
//! excludes "LLM provider model catalog maintenance"), but the Platform
//! Bridge's `chat_completion`/`structured_output` verbs (§4.I) need some
//! client to multiplex to.
//!
//! Adapted from the teacher's `openai.rs` (an OpenAI-compatible
//! chat-completions client over `reqwest`): same request/response shapes,
//! same header handling, trimmed to the single non-streaming call the
//! Bridge makes — "streams are disabled over the bridge" (§4.I).

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

/// The Bridge's `chat_completion` request payload (§4.I table): `{messages,
/// model?, tools?, tool_choice?, extra}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
    pub raw: Value,
}

#[derive(Serialize)]
struct OaiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: &'a Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: &'a Option<Value>,
}

#[derive(Deserialize)]
struct OaiChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
}

/// The gateway shape this core speaks: an OpenAI-compatible
/// `/chat/completions` endpoint. Multiple LLM providers behind the gateway
/// are the collaborator's concern (§1 Non-goals); this client just needs
/// one supported wire shape to multiplex requests to.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl GatewayClient {
    pub fn new(base_url: String, api_key: Option<String>, default_model: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model,
        }
    }

    /// Proxies `chat_completion` (§4.I): a single completed response, no
    /// streaming, regardless of what the underlying gateway supports.
    pub async fn chat_completion(&self, req: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let model = req.model.as_deref().unwrap_or(&self.default_model);
        let body = OaiRequest {
            model,
            messages: &req.messages,
            stream: false,
            tools: &req.tools,
            tool_choice: &req.tool_choice,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut rb = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {key}"));
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| CoreError::PlatformCallFailed { message: format!("gateway request failed: {e}") })?;
        let status = resp.status();
        let raw: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::PlatformCallFailed { message: format!("gateway returned non-JSON: {e}") })?;
        if !status.is_success() {
            return Err(CoreError::PlatformCallFailed {
                message: format!("gateway error ({status}): {raw}"),
            });
        }

        let parsed: OaiChatResponse = serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::PlatformCallFailed { message: format!("malformed gateway response: {e}") })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::PlatformCallFailed { message: "gateway returned no choices".into() })?;

        Ok(ChatCompletionResponse {
            message: choice.message,
            finish_reason: choice.finish_reason,
            raw,
        })
    }

    /// `structured_output` (§4.I): same call, then validates the parsed
    /// message content against a caller-supplied JSON schema.
    pub async fn structured_output(
        &self,
        req: &ChatCompletionRequest,
        schema: &Value,
    ) -> Result<(Value, ChatCompletionResponse)> {
        let completion = self.chat_completion(req).await?;
        let parsed: Value = serde_json::from_str(&completion.message.content).map_err(|e| {
            CoreError::PlatformCallFailed {
                message: format!("structured_output: model response is not valid JSON: {e}"),
            }
        })?;

        let validator = jsonschema::validator_for(schema).map_err(|e| CoreError::PlatformCallFailed {
            message: format!("structured_output: caller schema does not compile: {e}"),
        })?;
        let messages: Vec<String> = validator.iter_errors(&parsed).map(|e| e.to_string()).collect();
        if !messages.is_empty() {
            return Err(CoreError::PlatformCallFailed {
                message: format!("structured_output: response failed schema validation: {}", messages.join("; ")),
            });
        }

        Ok((parsed, completion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_completion_request_deserializes_minimal_payload() {
        let raw = serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}]
        });
        let req: ChatCompletionRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert!(req.model.is_none());
    }
}
