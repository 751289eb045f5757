//! The seam between the control loop and whatever chat-completions API
//! backs it. `switchboard-cli` provides the concrete OpenAI-compatible
//! implementation; this crate only defines the contract, the way
//! `examples/ya-luotao-codex/codex-rs/core` separates its `ModelClient`
//! trait from the concrete provider wiring that lives in the CLI binary.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

/// One requested tool invocation as the LLM phrased it, before argument
/// repair.
///
/// `argument_error` is set instead of `arguments` being populated when the
/// adapter received tool-call arguments that didn't parse as JSON at all —
/// `Value::Null` can't carry that distinction itself, since it's also what
/// a legitimately empty argument list deserializes to. A call with
/// `argument_error` set is never dispatched to a server; the control loop
/// synthesizes its tool-result text directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_error: Option<String>,
}

/// A tool description formatted for the LLM's function-calling schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub enum LlmResponse {
    Final(String),
    ToolCalls(Vec<ToolCallRequest>),
}

/// A chat-completions backend. One round of the control loop is one call
/// to [`LlmAdapter::complete`].
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> Result<LlmResponse>;

    /// A final, tool-call-free completion, used once the control loop has
    /// exhausted its round budget and must produce an answer regardless.
    async fn complete_final(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        match self.complete(model, messages, &[]).await? {
            LlmResponse::Final(text) => Ok(text),
            LlmResponse::ToolCalls(_) => Ok(String::new()),
        }
    }
}
