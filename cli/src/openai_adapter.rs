//! The one concrete [`LlmAdapter`]: any OpenAI-compatible chat
//! completions endpoint (OpenAI itself, a local vLLM/Ollama server,
//! etc.), reached with a plain `reqwest::Client` the way
//! `examples/ya-luotao-codex/codex-rs/core`'s provider clients do.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use switchboard_core::llm_adapter::ChatMessage;
use switchboard_core::llm_adapter::LlmAdapter;
use switchboard_core::llm_adapter::LlmResponse;
use switchboard_core::llm_adapter::ToolCallRequest;
use switchboard_core::llm_adapter::ToolDescriptor;
use switchboard_core::Result;
use switchboard_core::SwitchboardError;

pub struct OpenAiCompatibleAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleAdapter {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolFunctionWrapper<'a>>,
}

#[derive(Serialize)]
struct ToolFunctionWrapper<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolDescriptor,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Deserialize)]
struct RawToolCall {
    id: String,
    function: RawFunctionCall,
}

#[derive(Deserialize)]
struct RawFunctionCall {
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmAdapter for OpenAiCompatibleAdapter {
    async fn complete(&self, model: &str, messages: &[ChatMessage], tools: &[ToolDescriptor]) -> Result<LlmResponse> {
        let tool_wrappers: Vec<ToolFunctionWrapper> = tools
            .iter()
            .map(|t| ToolFunctionWrapper {
                kind: "function",
                function: t,
            })
            .collect();
        let body = ChatCompletionRequest {
            model,
            messages,
            tools: tool_wrappers,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SwitchboardError::Llm(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SwitchboardError::Llm(format!("HTTP {status}: {body}")));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| SwitchboardError::Llm(format!("malformed chat completion response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| SwitchboardError::Llm("response had no choices".to_string()))?;

        if choice.message.tool_calls.is_empty() {
            Ok(LlmResponse::Final(choice.message.content.unwrap_or_default()))
        } else {
            let calls = choice
                .message
                .tool_calls
                .into_iter()
                .map(|raw| match serde_json::from_str::<Value>(&raw.function.arguments) {
                    Ok(arguments) => ToolCallRequest {
                        id: raw.id,
                        name: raw.function.name,
                        arguments,
                        argument_error: None,
                    },
                    Err(parse_err) => ToolCallRequest {
                        id: raw.id,
                        name: raw.function.name,
                        arguments: Value::Null,
                        argument_error: Some(parse_err.to_string()),
                    },
                })
                .collect();
            Ok(LlmResponse::ToolCalls(calls))
        }
    }
}
